//! statebean Metrics Collection
//!
//! Per-container invocation metrics: call counts, success/failure rates and
//! latency percentiles per bean method, plus the administrative counters of
//! the container's stateful cache.
//!
//! # Architecture
//!
//! - [`MetricsRegistry`]: lock-free counters with periodic LRU/TTL cleanup
//! - [`MetricsCollector`]: trait answering the built-in endpoints
//! - [`MetricsSnapshot`] and [`CacheStats`]: serializable snapshots
//!
//! # Usage Example
//!
//! ```rust
//! use statebean_metrics::{ContainerMetricsCollector, MetricsCollector};
//! use std::time::Instant;
//!
//! let collector = ContainerMetricsCollector::new("cart");
//!
//! let start = Instant::now();
//! // ... invoke the bean method ...
//! collector.record_call("add_item", start, true);
//!
//! let snapshot = collector.snapshot();
//! println!("Total requests: {}", snapshot.total_requests);
//! ```
//!
//! # Built-in Monitoring Endpoints
//!
//! - **`_metrics`**: returns the container's [`MetricsSnapshot`]
//! - **`_info`**: returns [`ServerInfo`] with node name, version and uptime
//!
//! These never reach a bean.

mod collector;
mod registry;
mod snapshot;

pub use collector::{
    CacheStatsSource, ContainerMetricsCollector, MetricsCollector, INFO_ENDPOINT,
    METRICS_ENDPOINT,
};
pub use registry::{MetricsConfig, MetricsRegistry};
pub use snapshot::{CacheStats, MethodMetrics, MetricsSnapshot, ServerInfo};
