//! Clustering support for statebean containers.
//!
//! - [`FamilyRegistry`]: live [`ReplicantView`] per proxy family, updated by
//!   `replicants_changed` deliveries
//! - [`LoadBalancePolicy`]: target selection for clustered proxies
//! - [`Partition`]: in-process membership service driving the registries
//! - [`ReplicaStore`] / [`ReplicationGroup`]: session state replication

pub mod config;
pub mod family;
pub mod load_balancer;
pub mod partition;
pub mod replication;
pub mod view;

pub use config::ClusterConfig;
pub use family::{Family, FamilyRegistry, ReplicantListener, ViewChange};
pub use load_balancer::{
    FirstAvailable, LoadBalancePolicy, LoadBalancePolicyKind, RandomRobin, RoundRobin,
};
pub use partition::{HostedFamily, Partition};
pub use replication::{
    ReplicaSource, ReplicaStore, ReplicatedState, ReplicationGroup, ReplicationMode,
    StateReplicator, DEFAULT_EVICTION_MEMORY,
};
pub use view::{Replicant, ReplicantView};
