//! Deployment configuration.
//!
//! Everything a container needs is assembled once into a [`ContainerConfig`]
//! and handed to [`Container::start`](crate::Container::start). The CLI
//! reads a [`DeploymentConfig`] holding several of them from a JSON file.

use serde::{Deserialize, Serialize};
use statebean_cluster::ClusterConfig;
use statebean_common::protocol::error::{BeanError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Cache implementation selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    /// Bounded cache passivating least recently used contexts.
    #[default]
    Lru,
    /// Unbounded cache that never passivates; only removal timeouts apply.
    NoPassivation,
}

impl CacheKind {
    pub fn passivates(self) -> bool {
        matches!(self, CacheKind::Lru)
    }
}

/// What a second caller does when the session it asks for is checked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Wait up to `timeout_ms` for the holder to check the context in.
    Block { timeout_ms: u64 },
    /// Fail immediately.
    FailFast,
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        ConcurrencyPolicy::Block { timeout_ms: 5000 }
    }
}

/// Stateful cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub kind: CacheKind,
    /// Maximum number of resident (non-passivated) contexts.
    pub max_size: usize,
    /// Idle time after which a checked-in context is passivated.
    pub max_age_ms: Option<u64>,
    /// Idle time after which a context is removed, passivated or not.
    pub removal_timeout_ms: Option<u64>,
    /// Period of the background idle scan.
    pub check_interval_ms: u64,
    /// Number of removed/expired ids remembered for error reporting.
    pub tombstone_capacity: usize,
    /// Directory for passivated state; in memory when unset.
    pub passivation_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kind: CacheKind::Lru,
            max_size: 100_000,
            max_age_ms: Some(300_000),
            removal_timeout_ms: None,
            check_interval_ms: 10_000,
            tombstone_capacity: 10_000,
            passivation_dir: None,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kind(mut self, kind: CacheKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age_ms = max_age.map(|d| d.as_millis() as u64);
        self
    }

    pub fn with_removal_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.removal_timeout_ms = timeout.map(|d| d.as_millis() as u64);
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_passivation_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.passivation_dir = Some(dir.into());
        self
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_ms.map(Duration::from_millis)
    }

    pub fn removal_timeout(&self) -> Option<Duration> {
        self.removal_timeout_ms.map(Duration::from_millis)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.kind.passivates() && self.max_size == 0 {
            return Err(BeanError::Deployment(
                "cache max_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Interceptors a container can build from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterceptorKind {
    Logging,
    Transaction,
}

/// Configuration of one container.
///
/// ```
/// use statebean_container::{CacheKind, ContainerConfig};
///
/// let config: ContainerConfig = serde_json::from_str(
///     r#"{ "name": "cart", "cache": { "max_size": 2, "max_age_ms": null } }"#,
/// ).unwrap();
/// assert_eq!(config.cache.kind, CacheKind::Lru);
/// assert_eq!(config.cache.max_size, 2);
/// assert!(config.cache.max_age().is_none());
/// assert!(!config.cluster.enabled);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub name: String,
    pub cache: CacheConfig,
    pub cluster: ClusterConfig,
    pub concurrency: ConcurrencyPolicy,
    pub interceptors: Vec<InterceptorKind>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            cache: CacheConfig::default(),
            cluster: ClusterConfig::default(),
            concurrency: ConcurrencyPolicy::default(),
            interceptors: vec![InterceptorKind::Logging, InterceptorKind::Transaction],
        }
    }
}

impl ContainerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_cluster(mut self, cluster: ClusterConfig) -> Self {
        self.cluster = cluster;
        self
    }

    pub fn with_concurrency(mut self, policy: ConcurrencyPolicy) -> Self {
        self.concurrency = policy;
        self
    }

    pub fn with_interceptors(mut self, interceptors: Vec<InterceptorKind>) -> Self {
        self.interceptors = interceptors;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(BeanError::Deployment("container name is empty".to_string()));
        }
        if self.name.starts_with('_') {
            return Err(BeanError::Deployment(format!(
                "container name '{}' is reserved",
                self.name
            )));
        }
        self.cache.validate()
    }
}

/// A node's deployment: where to listen and which containers to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub node: String,
    pub bind: String,
    pub containers: Vec<ContainerConfig>,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            node: "node1".to_string(),
            bind: "127.0.0.1:7800".to_string(),
            containers: Vec::new(),
        }
    }
}

impl DeploymentConfig {
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            BeanError::Deployment(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&data)
    }
}
