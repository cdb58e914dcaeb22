//! In-process cluster partition.
//!
//! Tracks which nodes are members and which proxy families each hosts. Every
//! membership change bumps the partition-wide view id and delivers the new
//! replicant list of each affected family to every subscribed
//! [`FamilyRegistry`].

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::family::FamilyRegistry;
use crate::view::Replicant;

/// A family hosted by a member, with the locator clients use to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedFamily {
    pub family: String,
    pub locator: String,
}

impl HostedFamily {
    pub fn new(family: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            locator: locator.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct Member {
    node: String,
    hosted: Vec<HostedFamily>,
}

#[derive(Debug, Default)]
struct PartitionState {
    view_id: u64,
    /// Members in join order; replicant lists follow this order.
    members: Vec<Member>,
}

impl PartitionState {
    fn replicants(&self, family: &str) -> Vec<Replicant> {
        self.members
            .iter()
            .flat_map(|m| {
                m.hosted
                    .iter()
                    .filter(|h| h.family == family)
                    .map(move |h| Replicant::new(m.node.clone(), h.locator.clone()))
            })
            .collect()
    }
}

/// Membership service for one partition.
///
/// The state lock is held while notifications are delivered, so deliveries
/// reach registries in view-id order. Listeners must not call back into the
/// partition.
///
/// # Example
///
/// ```
/// use statebean_cluster::{FamilyRegistry, HostedFamily, Partition};
/// use std::sync::Arc;
///
/// let partition = Partition::new("DefaultPartition");
/// let registry = Arc::new(FamilyRegistry::new());
/// partition.subscribe(registry.clone());
///
/// partition.join("node1", vec![HostedFamily::new("cart", "127.0.0.1:7801")]);
/// partition.join("node2", vec![HostedFamily::new("cart", "127.0.0.1:7802")]);
///
/// let view = registry.view("cart").unwrap();
/// assert_eq!(view.len(), 2);
/// assert_eq!(view.view_id(), partition.view_id());
/// ```
#[derive(Debug)]
pub struct Partition {
    name: String,
    state: Mutex<PartitionState>,
    registries: RwLock<Vec<Arc<FamilyRegistry>>>,
}

impl Partition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(PartitionState::default()),
            registries: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribes a registry and brings it up to date with the current
    /// membership.
    pub fn subscribe(&self, registry: Arc<FamilyRegistry>) {
        let state = self.state.lock();
        if state.view_id > 0 {
            let families: BTreeSet<&str> = state
                .members
                .iter()
                .flat_map(|m| m.hosted.iter().map(|h| h.family.as_str()))
                .collect();
            for family in families {
                registry.replicants_changed(family, state.replicants(family), state.view_id);
            }
        }
        self.registries.write().push(registry);
    }

    /// Adds `node` (or replaces what it hosts if already a member).
    ///
    /// Returns the new view id.
    pub fn join(&self, node: &str, hosted: Vec<HostedFamily>) -> u64 {
        let mut state = self.state.lock();

        let mut affected: BTreeSet<String> = hosted.iter().map(|h| h.family.clone()).collect();
        match state.members.iter_mut().find(|m| m.node == node) {
            Some(member) => {
                affected.extend(member.hosted.iter().map(|h| h.family.clone()));
                member.hosted = hosted;
            }
            None => state.members.push(Member {
                node: node.to_string(),
                hosted,
            }),
        }

        state.view_id += 1;
        info!("Node {} joined partition '{}' (view {})", node, self.name, state.view_id);
        self.deliver(&state, &affected);
        state.view_id
    }

    /// Removes `node`. Returns the new view id, or `None` if it was not a
    /// member.
    pub fn leave(&self, node: &str) -> Option<u64> {
        let mut state = self.state.lock();

        let idx = state.members.iter().position(|m| m.node == node)?;
        let member = state.members.remove(idx);
        let affected: BTreeSet<String> = member.hosted.into_iter().map(|h| h.family).collect();

        state.view_id += 1;
        info!("Node {} left partition '{}' (view {})", node, self.name, state.view_id);
        self.deliver(&state, &affected);
        Some(state.view_id)
    }

    fn deliver(&self, state: &PartitionState, affected: &BTreeSet<String>) {
        let registries = self.registries.read().clone();
        for family in affected {
            let replicants = state.replicants(family);
            debug!(
                "Delivering view {} of family '{}' with {} replicant(s) in partition '{}'",
                state.view_id,
                family,
                replicants.len(),
                self.name
            );
            for registry in &registries {
                registry.replicants_changed(family, replicants.clone(), state.view_id);
            }
        }
    }

    pub fn view_id(&self) -> u64 {
        self.state.lock().view_id
    }

    pub fn members(&self) -> Vec<String> {
        self.state.lock().members.iter().map(|m| m.node.clone()).collect()
    }

    pub fn replicants(&self, family: &str) -> Vec<Replicant> {
        self.state.lock().replicants(family)
    }
}
