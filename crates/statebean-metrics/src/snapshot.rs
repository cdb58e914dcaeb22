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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Server information returned by `_info`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerInfo {
    pub node: String,
    pub version: String,
    pub uptime_ms: u64,
    pub containers: Vec<String>,
}

impl ServerInfo {
    pub fn new(node: impl Into<String>, uptime_ms: u64, containers: Vec<String>) -> Self {
        Self {
            node: node.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_ms,
            containers,
        }
    }
}

/// Metrics for a single bean method
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MethodMetrics {
    pub call_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_time_us: u64,
    pub avg_latency_us: u64,
    pub p50_latency_us: u64,
    pub p95_latency_us: u64,
    pub p99_latency_us: u64,
}

impl MethodMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Administrative counters of a stateful cache.
///
/// `current_size` counts every tracked context, resident or passivated;
/// `resident_size` only the ones holding a live instance. `available_count`
/// is the number of resident contexts not checked out.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheStats {
    pub create_count: u64,
    pub remove_count: u64,
    pub passivate_count: u64,
    pub activate_count: u64,
    pub current_size: usize,
    pub resident_size: usize,
    pub available_count: usize,
    pub max_size: usize,
}

impl CacheStats {
    /// Contexts currently held in secondary storage.
    pub fn passivated_size(&self) -> usize {
        self.current_size.saturating_sub(self.resident_size)
    }

    /// Contexts currently checked out by an invocation.
    pub fn in_use_count(&self) -> usize {
        self.resident_size.saturating_sub(self.available_count)
    }
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub container: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub uptime_ms: u64,
    pub methods: HashMap<String, MethodMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
}

impl MetricsSnapshot {
    pub fn new(container: impl Into<String>, uptime_ms: u64) -> Self {
        Self {
            container: container.into(),
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            uptime_ms,
            methods: HashMap::new(),
            cache: None,
        }
    }

    pub fn with_cache(mut self, stats: CacheStats) -> Self {
        self.cache = Some(stats);
        self
    }
}
