//! Session state replication.
//!
//! Every clustered node owns a [`ReplicaStore`] holding copies of sessions
//! whose primary lives elsewhere. The primary's cache pushes state through a
//! [`StateReplicator`] after each dirty check-in; when a client fails over,
//! the new node's cache adopts the copy from its own store through
//! [`ReplicaSource`]. A node still holding an older copy of a session that a
//! peer has since taken over finds the newer version in the same store.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statebean_common::SessionId;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

/// Number of evicted sessions a store remembers.
pub const DEFAULT_EVICTION_MEMORY: usize = 10_000;

type ReplicaKey = (String, SessionId);

/// Replicated copy of one session's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedState {
    pub container: String,
    pub session_id: SessionId,
    pub version: u64,
    pub state: Value,
    #[serde(default)]
    pub parent: Option<SessionId>,
    #[serde(default)]
    pub children: Vec<SessionId>,
}

/// Sink for state changes of primary copies.
pub trait StateReplicator: Send + Sync {
    fn replicate(&self, state: ReplicatedState);

    /// Drops every replica of a removed session.
    fn evict(&self, container: &str, id: SessionId);
}

/// Replicas held for the local cache.
///
/// A cache reads a replica with [`peek`](ReplicaSource::peek) and only
/// [`release`](ReplicaSource::release)s it once the session is installed, so
/// a failed adoption leaves the copy in place.
pub trait ReplicaSource: Send + Sync {
    fn peek(&self, container: &str, id: SessionId) -> Option<ReplicatedState>;

    /// Drops the replica after this node became its primary, unless a version
    /// newer than `version` arrived in the meantime.
    fn release(&self, container: &str, id: SessionId, version: u64);

    /// Drops the replica of a session removed on this node and refuses later
    /// copies of it.
    fn forget(&self, container: &str, id: SessionId);
}

/// How the primary pushes state to its peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    /// Peers are updated before the check-in returns.
    #[default]
    Sync,
    /// Peers are updated from a spawned task.
    Async,
}

/// Bounded memory of evicted sessions.
#[derive(Debug)]
struct Evictions {
    order: VecDeque<ReplicaKey>,
    keys: HashSet<ReplicaKey>,
    capacity: usize,
}

impl Evictions {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            keys: HashSet::new(),
            capacity,
        }
    }

    fn record(&mut self, key: ReplicaKey) {
        if self.capacity == 0 {
            return;
        }
        if self.keys.insert(key.clone()) {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
    }

    fn contains(&self, key: &ReplicaKey) -> bool {
        self.keys.contains(key)
    }
}

/// Replica store of one node.
///
/// Evicted sessions are remembered so a copy pushed before the eviction but
/// delivered after it is dropped.
#[derive(Debug)]
pub struct ReplicaStore {
    node: String,
    entries: DashMap<ReplicaKey, ReplicatedState>,
    // Held across every insert and eviction
    evicted: Mutex<Evictions>,
}

impl ReplicaStore {
    pub fn new(node: impl Into<String>) -> Self {
        Self::with_eviction_memory(node, DEFAULT_EVICTION_MEMORY)
    }

    pub fn with_eviction_memory(node: impl Into<String>, capacity: usize) -> Self {
        Self {
            node: node.into(),
            entries: DashMap::new(),
            evicted: Mutex::new(Evictions::new(capacity)),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Stores `state` unless a newer version is already held or the session
    /// was evicted. Returns whether the copy was kept.
    pub fn put(&self, state: ReplicatedState) -> bool {
        let key = (state.container.clone(), state.session_id);
        let evicted = self.evicted.lock();
        if evicted.contains(&key) {
            trace!(
                "Node {} dropping replica of evicted session {}",
                self.node, state.session_id
            );
            return false;
        }
        match self.entries.entry(key) {
            Entry::Occupied(mut held) => {
                if held.get().version > state.version {
                    trace!(
                        "Node {} ignoring version {} of session {}, holds {}",
                        self.node,
                        state.version,
                        state.session_id,
                        held.get().version
                    );
                    false
                } else {
                    held.insert(state);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(state);
                true
            }
        }
    }

    /// Drops the replica of a removed session and refuses later copies.
    pub fn evict(&self, container: &str, id: SessionId) -> bool {
        let key = (container.to_string(), id);
        let mut evicted = self.evicted.lock();
        evicted.record(key.clone());
        self.entries.remove(&key).is_some()
    }

    pub fn is_evicted(&self, container: &str, id: SessionId) -> bool {
        self.evicted.lock().contains(&(container.to_string(), id))
    }

    pub fn get(&self, container: &str, id: SessionId) -> Option<ReplicatedState> {
        self.entries
            .get(&(container.to_string(), id))
            .map(|e| e.value().clone())
    }

    pub fn sessions(&self, container: &str) -> Vec<SessionId> {
        self.entries
            .iter()
            .filter(|e| e.key().0 == container)
            .map(|e| e.key().1)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl ReplicaSource for ReplicaStore {
    fn peek(&self, container: &str, id: SessionId) -> Option<ReplicatedState> {
        self.get(container, id)
    }

    fn release(&self, container: &str, id: SessionId, version: u64) {
        self.entries
            .remove_if(&(container.to_string(), id), |_, held| held.version <= version);
    }

    fn forget(&self, container: &str, id: SessionId) {
        self.evict(container, id);
    }
}

/// Fan-out of one node's primary copies to its peers' stores.
#[derive(Debug)]
pub struct ReplicationGroup {
    local: String,
    mode: ReplicationMode,
    peers: RwLock<Vec<Arc<ReplicaStore>>>,
}

impl ReplicationGroup {
    pub fn new(local: impl Into<String>, mode: ReplicationMode) -> Self {
        Self {
            local: local.into(),
            mode,
            peers: RwLock::new(Vec::new()),
        }
    }

    pub fn mode(&self) -> ReplicationMode {
        self.mode
    }

    /// Adds a peer store. The local node's own store is never a peer.
    pub fn add_peer(&self, store: Arc<ReplicaStore>) {
        if store.node() == self.local {
            return;
        }
        let mut peers = self.peers.write();
        if !peers.iter().any(|p| p.node() == store.node()) {
            debug!("Node {} replicating to {}", self.local, store.node());
            peers.push(store);
        }
    }

    pub fn remove_peer(&self, node: &str) -> bool {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|p| p.node() != node);
        peers.len() != before
    }

    pub fn peers(&self) -> Vec<String> {
        self.peers.read().iter().map(|p| p.node().to_string()).collect()
    }

    fn push(peers: &[Arc<ReplicaStore>], state: &ReplicatedState) {
        for peer in peers {
            peer.put(state.clone());
        }
    }
}

impl StateReplicator for ReplicationGroup {
    fn replicate(&self, state: ReplicatedState) {
        let peers = self.peers.read().clone();
        if peers.is_empty() {
            return;
        }

        trace!(
            "Replicating version {} of session {} from {} to {} peer(s)",
            state.version,
            state.session_id,
            self.local,
            peers.len()
        );

        match (self.mode, tokio::runtime::Handle::try_current()) {
            (ReplicationMode::Async, Ok(handle)) => {
                handle.spawn(async move { Self::push(&peers, &state) });
            }
            _ => Self::push(&peers, &state),
        }
    }

    fn evict(&self, container: &str, id: SessionId) {
        for peer in self.peers.read().iter() {
            peer.evict(container, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(id: SessionId, version: u64, items: u64) -> ReplicatedState {
        ReplicatedState {
            container: "cart".to_string(),
            session_id: id,
            version,
            state: json!({ "items": items }),
            parent: None,
            children: Vec::new(),
        }
    }

    #[test]
    fn test_store_keeps_newest_version() {
        let store = ReplicaStore::new("node2");
        let id = SessionId::new();

        store.put(state(id, 2, 5));
        store.put(state(id, 1, 1));
        assert_eq!(store.get("cart", id).unwrap().version, 2);

        store.put(state(id, 3, 6));
        assert_eq!(store.get("cart", id).unwrap().state, json!({ "items": 6 }));
    }

    #[test]
    fn test_release_keeps_newer_replica() {
        let store = ReplicaStore::new("node2");
        let id = SessionId::new();
        store.put(state(id, 1, 1));

        assert_eq!(store.peek("cart", id).unwrap().version, 1);
        assert_eq!(store.len(), 1);

        // A newer copy landed between peek and release
        store.put(state(id, 2, 2));
        store.release("cart", id, 1);
        assert_eq!(store.get("cart", id).unwrap().version, 2);

        store.release("cart", id, 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_evicted_session_is_not_stored_again() {
        let store = ReplicaStore::new("node2");
        let id = SessionId::new();
        store.put(state(id, 1, 1));

        assert!(store.evict("cart", id));
        assert!(!store.put(state(id, 2, 2)));
        assert!(store.get("cart", id).is_none());
        assert!(store.is_evicted("cart", id));

        // Other containers may use the same id
        let mut other = state(id, 1, 1);
        other.container = "wallet".to_string();
        assert!(store.put(other));
    }

    #[test]
    fn test_eviction_memory_is_bounded() {
        let store = ReplicaStore::with_eviction_memory("node2", 2);
        let ids: Vec<SessionId> = (0..3).map(|_| SessionId::new()).collect();
        for id in &ids {
            store.evict("cart", *id);
        }
        assert!(!store.is_evicted("cart", ids[0]));
        assert!(store.is_evicted("cart", ids[2]));
    }

    #[test]
    fn test_sync_group_pushes_to_peers() {
        let group = ReplicationGroup::new("node1", ReplicationMode::Sync);
        let local = Arc::new(ReplicaStore::new("node1"));
        let peer = Arc::new(ReplicaStore::new("node2"));
        group.add_peer(local.clone());
        group.add_peer(peer.clone());
        group.add_peer(peer.clone());
        assert_eq!(group.peers(), vec!["node2".to_string()]);

        let id = SessionId::new();
        group.replicate(state(id, 1, 3));
        assert!(local.is_empty());
        assert_eq!(peer.sessions("cart"), vec![id]);

        group.evict("cart", id);
        assert!(peer.is_empty());
        assert!(peer.is_evicted("cart", id));
    }

    #[tokio::test]
    async fn test_async_group_pushes_eventually() {
        let group = ReplicationGroup::new("node1", ReplicationMode::Async);
        let peer = Arc::new(ReplicaStore::new("node2"));
        group.add_peer(peer.clone());

        let id = SessionId::new();
        group.replicate(state(id, 1, 3));

        for _ in 0..50 {
            if peer.get("cart", id).is_some() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("replica never arrived");
    }

    #[tokio::test]
    async fn test_async_push_after_evict_is_dropped() {
        let group = ReplicationGroup::new("node1", ReplicationMode::Async);
        let peer = Arc::new(ReplicaStore::new("node2"));
        group.add_peer(peer.clone());

        let id = SessionId::new();
        // The push is still queued when the session is evicted
        group.replicate(state(id, 1, 3));
        group.evict("cart", id);

        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(peer.get("cart", id).is_none());
    }
}
