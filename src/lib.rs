//! statebean
//!
//! Facade over the statebean workspace: a container for stateful session
//! beans with a bounded passivating cache, an invocation dispatcher, local,
//! remote and clustered proxies, and replicant-view driven failover.

pub use statebean_client as client;
pub use statebean_cluster as cluster;
pub use statebean_common as common;
pub use statebean_container as container;
pub use statebean_metrics as metrics;
