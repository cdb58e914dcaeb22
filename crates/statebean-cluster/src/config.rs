use serde::{Deserialize, Serialize};

use crate::load_balancer::LoadBalancePolicyKind;
use crate::replication::ReplicationMode;

/// Clustering settings of one container.
///
/// ```
/// use statebean_cluster::{ClusterConfig, LoadBalancePolicyKind};
///
/// let config: ClusterConfig =
///     serde_json::from_str(r#"{"enabled": true, "policy": "first_available"}"#).unwrap();
/// assert_eq!(config.partition, "DefaultPartition");
/// assert_eq!(config.policy, LoadBalancePolicyKind::FirstAvailable);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub enabled: bool,
    pub partition: String,
    /// Proxy family name; the container name when unset.
    pub family: Option<String>,
    pub policy: LoadBalancePolicyKind,
    pub replication: ReplicationMode,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            partition: "DefaultPartition".to_string(),
            family: None,
            policy: LoadBalancePolicyKind::default(),
            replication: ReplicationMode::default(),
        }
    }
}

impl ClusterConfig {
    /// Family key for a container called `container`.
    pub fn family_key(&self, container: &str) -> String {
        self.family.clone().unwrap_or_else(|| container.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_key_defaults_to_container() {
        let mut config = ClusterConfig::default();
        assert_eq!(config.family_key("cart"), "cart");
        config.family = Some("cart-family".to_string());
        assert_eq!(config.family_key("cart"), "cart-family");
    }
}
