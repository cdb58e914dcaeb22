// Copyright 2025 statebean Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::registry::{MetricsConfig, MetricsRegistry};
use crate::snapshot::{CacheStats, MetricsSnapshot, ServerInfo};
use serde_json::json;
use statebean_common::protocol::error::{BeanError, Result};
use statebean_common::protocol::{RequestId, Response};
use std::sync::Arc;
use std::time::Instant;

/// Name of the built-in endpoint returning a [`MetricsSnapshot`].
pub const METRICS_ENDPOINT: &str = "_metrics";

/// Name of the built-in endpoint returning [`ServerInfo`].
pub const INFO_ENDPOINT: &str = "_info";

/// Source of cache counters attached to `_metrics` answers.
pub trait CacheStatsSource: Send + Sync {
    fn cache_stats(&self) -> CacheStats;
}

/// Metrics collection for a statebean container.
///
/// Implementations answer the two built-in endpoints, `_metrics` and
/// `_info`, which are intercepted before any bean method is resolved.
///
/// # Example
///
/// ```rust
/// use statebean_metrics::{ContainerMetricsCollector, MetricsCollector};
/// use std::time::Instant;
///
/// let collector = ContainerMetricsCollector::new("cart");
///
/// let start = Instant::now();
/// collector.record_call("add_item", start, true);
///
/// assert!(collector.is_metrics_request("_metrics"));
/// let response = collector.handle_metrics_request("_metrics", 1).unwrap();
/// assert!(response.success);
/// ```
pub trait MetricsCollector: Send + Sync {
    /// Returns `true` for `_metrics` and `_info`.
    fn is_metrics_request(&self, endpoint: &str) -> bool;

    /// Answers a built-in endpoint.
    ///
    /// Any other endpoint name is rejected with `InvalidRequest`.
    fn handle_metrics_request(&self, endpoint: &str, id: RequestId) -> Result<Response>;

    /// Records one completed invocation, timed from `start_time`.
    fn record_call(&self, method: &str, start_time: Instant, success: bool);

    fn snapshot(&self) -> MetricsSnapshot;
}

/// Metrics collector owned by one container.
///
/// Tracks per-method call counts and latencies; when a cache is attached its
/// administrative counters are included in every `_metrics` snapshot.
pub struct ContainerMetricsCollector {
    container: String,
    node: String,
    registry: Arc<MetricsRegistry>,
    cache: Option<Arc<dyn CacheStatsSource>>,
}

impl ContainerMetricsCollector {
    pub fn new(container: impl Into<String>) -> Self {
        Self::with_config(container, MetricsConfig::default())
    }

    pub fn with_config(container: impl Into<String>, config: MetricsConfig) -> Self {
        Self {
            container: container.into(),
            node: "local".to_string(),
            registry: Arc::new(MetricsRegistry::with_config(config)),
            cache: None,
        }
    }

    /// Sets the node name reported by `_info`.
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    /// Attaches the cache whose counters are reported alongside call metrics.
    pub fn with_cache(mut self, cache: Arc<dyn CacheStatsSource>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo::new(
            self.node.clone(),
            self.registry.uptime_ms(),
            vec![self.container.clone()],
        )
    }
}

impl MetricsCollector for ContainerMetricsCollector {
    fn is_metrics_request(&self, endpoint: &str) -> bool {
        endpoint == METRICS_ENDPOINT || endpoint == INFO_ENDPOINT
    }

    fn handle_metrics_request(&self, endpoint: &str, id: RequestId) -> Result<Response> {
        match endpoint {
            METRICS_ENDPOINT => Ok(Response::success(id, json!(self.snapshot()))),
            INFO_ENDPOINT => Ok(Response::success(id, json!(self.info()))),
            other => Err(BeanError::InvalidRequest(format!(
                "'{}' is not a built-in endpoint",
                other
            ))),
        }
    }

    fn record_call(&self, method: &str, start_time: Instant, success: bool) {
        let latency_us = start_time.elapsed().as_micros() as u64;
        self.registry.record_method_call(method, latency_us, success);
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let snapshot = self.registry.snapshot(&self.container);
        match &self.cache {
            Some(cache) => snapshot.with_cache(cache.cache_stats()),
            None => snapshot,
        }
    }
}
