use crate::snapshot::{MethodMetrics, MetricsSnapshot};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

const NUM_HISTOGRAM_BINS: usize = 80;

/// Cleanup runs once every this many recorded calls.
const CLEANUP_INTERVAL: u64 = 1000;

/// Fallback used when the system clock reports a time before UNIX_EPOCH.
static TIMESTAMP_FALLBACK: AtomicU64 = AtomicU64::new(1);

/// Last issued timestamp, so consecutive calls never return the same value.
static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// Generates a strictly increasing timestamp in milliseconds.
///
/// LRU eviction of method entries needs a total order of access times, so two
/// calls in the same millisecond still get distinct values.
fn get_monotonic_timestamp() -> u64 {
    let system_time = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_else(|_| TIMESTAMP_FALLBACK.fetch_add(1, Ordering::SeqCst));

    loop {
        let last = LAST_TIMESTAMP.load(Ordering::Acquire);
        let next = system_time.max(last + 1);
        if LAST_TIMESTAMP
            .compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Acquire)
            .is_ok()
        {
            return next;
        }
    }
}

/// Configuration for metrics cleanup and size limits.
///
/// # Example
///
/// ```rust
/// use statebean_metrics::MetricsConfig;
///
/// let config = MetricsConfig {
///     max_methods: 200,
///     method_ttl_secs: 1800,
/// };
/// ```
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Maximum number of distinct methods to track; least recently used
    /// entries are evicted beyond this.
    pub max_methods: usize,
    /// Methods not called within this many seconds are dropped at cleanup.
    pub method_ttl_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_methods: 1000,
            method_ttl_secs: 3600,
        }
    }
}

/// Log-linear latency histogram.
///
/// Each decade of microseconds is split into bins by leading digit, so bin
/// `d * 10 + k` covers `[k * 10^d, (k + 1) * 10^d)`. Everything above the last
/// decade lands in the final bin.
#[derive(Debug)]
struct LatencyHistogram {
    bins: [AtomicU64; NUM_HISTOGRAM_BINS],
    total_latency: AtomicU64,
    sample_count: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_latency: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
        }
    }

    fn record(&self, latency_us: u64) {
        let bin = Self::latency_to_bin(latency_us);
        self.bins[bin].fetch_add(1, Ordering::Relaxed);
        self.total_latency.fetch_add(latency_us, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
    }

    fn latency_to_bin(latency_us: u64) -> usize {
        if latency_us < 10 {
            return latency_us as usize;
        }
        let decade = latency_us.ilog10();
        let leading = latency_us / 10u64.pow(decade);
        let bin = decade as usize * 10 + leading as usize;
        bin.min(NUM_HISTOGRAM_BINS - 1)
    }

    /// Lower bound of a bin, in microseconds.
    fn bin_to_latency(bin: usize) -> u64 {
        let decade = (bin / 10) as u32;
        let sub = (bin % 10) as u64;
        if decade == 0 {
            sub
        } else {
            10u64.saturating_pow(decade).saturating_mul(sub.max(1))
        }
    }

    fn estimate_percentile(&self, percentile: u64) -> u64 {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        let target = ((total * percentile) / 100).max(1);
        let mut cumulative = 0;

        for (idx, bin) in self.bins.iter().enumerate() {
            let count = bin.load(Ordering::Relaxed);
            if count > 0 && cumulative + count >= target {
                let start = Self::bin_to_latency(idx);
                let end = Self::bin_to_latency(idx + 1).max(start + 1);
                let fraction = (target - cumulative) as f64 / count as f64;
                return start + (fraction * (end - start) as f64) as u64;
            }
            cumulative += count;
        }

        Self::bin_to_latency(NUM_HISTOGRAM_BINS - 1)
    }

    /// Returns `(avg, p50, p95, p99)` in microseconds.
    fn calculate_percentiles(&self) -> (u64, u64, u64, u64) {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return (0, 0, 0, 0);
        }

        let avg = self.total_latency.load(Ordering::Relaxed) / total;
        (
            avg,
            self.estimate_percentile(50),
            self.estimate_percentile(95),
            self.estimate_percentile(99),
        )
    }
}

/// Per-method counters.
///
/// All counters are independent and use relaxed ordering; snapshots are
/// best-effort point-in-time reads.
#[derive(Debug)]
struct MethodStats {
    call_count: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    total_time_us: AtomicU64,
    latencies: LatencyHistogram,
    last_access_ms: AtomicU64,
}

impl MethodStats {
    fn new() -> Self {
        Self {
            call_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            total_time_us: AtomicU64::new(0),
            latencies: LatencyHistogram::new(),
            last_access_ms: AtomicU64::new(get_monotonic_timestamp()),
        }
    }

    fn record(&self, latency_us: u64, success: bool) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        if success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        }
        self.total_time_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latencies.record(latency_us);
        self.last_access_ms
            .store(get_monotonic_timestamp(), Ordering::Relaxed);
    }

    fn snapshot(&self) -> MethodMetrics {
        let (avg_latency_us, p50_latency_us, p95_latency_us, p99_latency_us) =
            self.latencies.calculate_percentiles();

        MethodMetrics {
            call_count: self.call_count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            total_time_us: self.total_time_us.load(Ordering::Relaxed),
            avg_latency_us,
            p50_latency_us,
            p95_latency_us,
            p99_latency_us,
        }
    }
}

/// Thread-safe invocation metrics for one container.
///
/// Counter increments are lock-free atomics; the method map sits behind a
/// `RwLock` that is only written when a method is seen for the first time or
/// during cleanup. Every [`CLEANUP_INTERVAL`] calls, entries idle past the TTL
/// are dropped and the map is trimmed to `max_methods` by least recent use.
///
/// # Example
///
/// ```rust
/// use statebean_metrics::MetricsRegistry;
///
/// let registry = MetricsRegistry::new();
/// registry.record_method_call("add_item", 150, true);
///
/// let snapshot = registry.snapshot("cart");
/// assert_eq!(snapshot.total_requests, 1);
/// ```
#[derive(Debug)]
pub struct MetricsRegistry {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    methods: RwLock<HashMap<String, Arc<MethodStats>>>,
    start_time: Instant,
    config: MetricsConfig,
    cleanup_counter: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_config(MetricsConfig::default())
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            methods: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
            config,
            cleanup_counter: AtomicU64::new(0),
        }
    }

    /// Records one completed invocation of `method`.
    pub fn record_method_call(&self, method: &str, latency_us: u64, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }

        self.maybe_cleanup();

        let existing = self.methods.read().get(method).cloned();
        let stats = match existing {
            Some(stats) => stats,
            None => self
                .methods
                .write()
                .entry(method.to_string())
                .or_insert_with(|| Arc::new(MethodStats::new()))
                .clone(),
        };

        stats.record(latency_us, success);
    }

    fn maybe_cleanup(&self) {
        let count = self.cleanup_counter.fetch_add(1, Ordering::Relaxed);
        if count % CLEANUP_INTERVAL == 0 {
            self.cleanup_stale_entries();
        }
    }

    /// Drops entries idle past the TTL, then evicts the least recently used
    /// entries until at most `max_methods` remain.
    fn cleanup_stale_entries(&self) {
        let now = get_monotonic_timestamp();
        let ttl_ms = self.config.method_ttl_secs * 1000;
        let mut methods = self.methods.write();

        methods.retain(|_, stats| {
            now.saturating_sub(stats.last_access_ms.load(Ordering::Relaxed)) < ttl_ms
        });

        if methods.len() > self.config.max_methods {
            let mut entries: Vec<_> = methods
                .iter()
                .map(|(name, stats)| (name.clone(), stats.last_access_ms.load(Ordering::Relaxed)))
                .collect();
            entries.sort_by_key(|&(_, last_access)| last_access);

            let excess = entries.len() - self.config.max_methods;
            for (name, _) in entries.into_iter().take(excess) {
                methods.remove(&name);
            }
        }
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// Takes a snapshot of the counters, labelled with the container name.
    pub fn snapshot(&self, container: &str) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::new(container, self.uptime_ms());
        snapshot.total_requests = self.total_requests.load(Ordering::Relaxed);
        snapshot.successful_requests = self.successful_requests.load(Ordering::Relaxed);
        snapshot.failed_requests = self.failed_requests.load(Ordering::Relaxed);
        snapshot.methods = self
            .methods
            .read()
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();
        snapshot
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_method_tracking() {
        let registry = MetricsRegistry::new();

        registry.record_method_call("add_item", 100, true);
        registry.record_method_call("add_item", 200, true);
        registry.record_method_call("add_item", 50, false);

        let snapshot = registry.snapshot("cart");
        assert_eq!(snapshot.container, "cart");
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.successful_requests, 2);
        assert_eq!(snapshot.failed_requests, 1);

        let metrics = snapshot.methods.get("add_item").unwrap();
        assert_eq!(metrics.call_count, 3);
        assert_eq!(metrics.success_count, 2);
        assert_eq!(metrics.failure_count, 1);
        assert_eq!(metrics.total_time_us, 350);
        assert_eq!(metrics.avg_latency_us, 116);
    }

    #[test]
    fn test_percentiles_are_ordered() {
        let registry = MetricsRegistry::new();
        for i in 0..1000 {
            registry.record_method_call("checkout", i, true);
        }

        let snapshot = registry.snapshot("cart");
        let metrics = snapshot.methods.get("checkout").unwrap();
        assert!(metrics.p50_latency_us <= metrics.p95_latency_us);
        assert!(metrics.p95_latency_us <= metrics.p99_latency_us);
        assert!(metrics.p50_latency_us >= 100 && metrics.p50_latency_us <= 1000);
        assert!(metrics.p99_latency_us >= 900);
    }

    #[test]
    fn test_thread_safety() {
        let registry = Arc::new(MetricsRegistry::new());
        let mut handles = vec![];

        for t in 0..8 {
            let registry = registry.clone();
            handles.push(thread::spawn(move || {
                for i in 0..250 {
                    registry.record_method_call(&format!("method_{}", t % 4), i, i % 5 != 0);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = registry.snapshot("cart");
        assert_eq!(snapshot.total_requests, 2000);
        assert_eq!(snapshot.successful_requests + snapshot.failed_requests, 2000);
        let per_method: u64 = snapshot.methods.values().map(|m| m.call_count).sum();
        assert_eq!(per_method, 2000);
    }

    #[test]
    fn test_ttl_cleanup_drops_idle_methods() {
        let registry = MetricsRegistry::with_config(MetricsConfig {
            max_methods: 100,
            method_ttl_secs: 0,
        });
        registry.record_method_call("old", 10, true);
        registry.cleanup_stale_entries();
        assert!(registry.snapshot("cart").methods.is_empty());
        // Global counters are unaffected by cleanup
        assert_eq!(registry.snapshot("cart").total_requests, 1);
    }

    #[test]
    fn test_max_methods_keeps_most_recent() {
        let registry = MetricsRegistry::with_config(MetricsConfig {
            max_methods: 3,
            method_ttl_secs: 3600,
        });
        for i in 0..6 {
            registry.record_method_call(&format!("m{}", i), 10, true);
        }
        registry.cleanup_stale_entries();

        let snapshot = registry.snapshot("cart");
        assert_eq!(snapshot.methods.len(), 3);
        for kept in ["m3", "m4", "m5"] {
            assert!(snapshot.methods.contains_key(kept), "{} should survive", kept);
        }
    }

    #[test]
    fn test_monotonic_timestamps() {
        let a = get_monotonic_timestamp();
        let b = get_monotonic_timestamp();
        assert!(b > a);
    }

    #[test]
    fn test_histogram_bins() {
        assert_eq!(LatencyHistogram::latency_to_bin(0), 0);
        assert_eq!(LatencyHistogram::latency_to_bin(7), 7);
        assert_eq!(LatencyHistogram::latency_to_bin(10), 11);
        assert_eq!(LatencyHistogram::latency_to_bin(250), 22);
        assert_eq!(LatencyHistogram::latency_to_bin(u64::MAX), NUM_HISTOGRAM_BINS - 1);
        assert_eq!(LatencyHistogram::bin_to_latency(22), 200);
        assert_eq!(LatencyHistogram::bin_to_latency(10), 10);
    }

    #[test]
    fn test_histogram_empty() {
        let histogram = LatencyHistogram::new();
        assert_eq!(histogram.calculate_percentiles(), (0, 0, 0, 0));
    }
}
