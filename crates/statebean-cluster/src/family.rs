//! Proxy families and the replicant listener.
//!
//! A [`FamilyRegistry`] holds the current [`ReplicantView`] of every proxy
//! family known to this process. Membership changes arrive through
//! [`FamilyRegistry::replicants_changed`]; the new view is swapped in
//! atomically and subscribed listeners are told about it.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use statebean_common::protocol::error::Result;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::view::{Replicant, ReplicantView};

/// Callback told about every view installed for a family.
///
/// Errors and panics raised here are logged and never reach the caller of
/// `replicants_changed`.
pub trait ReplicantListener: Send + Sync {
    fn replicants_changed(&self, key: &str, view: &ReplicantView) -> Result<()>;
}

impl<F> ReplicantListener for F
where
    F: Fn(&str, &ReplicantView) -> Result<()> + Send + Sync,
{
    fn replicants_changed(&self, key: &str, view: &ReplicantView) -> Result<()> {
        self(key, view)
    }
}

/// Outcome of one `replicants_changed` delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewChange {
    Installed { view_id: u64 },
    /// Delivery carried a view id not newer than the installed one.
    Stale { current: u64, offered: u64 },
}

/// One proxy family: its live view and listeners.
pub struct Family {
    key: String,
    view: ArcSwap<ReplicantView>,
    delivery: Mutex<()>,
    listeners: RwLock<Vec<Arc<dyn ReplicantListener>>>,
}

impl Family {
    fn new(key: String) -> Self {
        Self {
            key,
            view: ArcSwap::from_pointee(ReplicantView::empty()),
            delivery: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Snapshot of the current view. Callers keep the `Arc` for the whole
    /// selection so a concurrent update cannot change the list under them.
    pub fn view(&self) -> Arc<ReplicantView> {
        self.view.load_full()
    }

    pub fn subscribe(&self, listener: Arc<dyn ReplicantListener>) {
        self.listeners.write().push(listener);
    }

    fn install(&self, replicants: Vec<Replicant>, view_id: u64) -> ViewChange {
        // Deliveries for one key are applied one at a time
        let _delivery = self.delivery.lock();

        let current = self.view.load().view_id();
        if view_id <= current {
            warn!(
                "Discarding stale replicant view {} of family '{}' (current {})",
                view_id, self.key, current
            );
            return ViewChange::Stale {
                current,
                offered: view_id,
            };
        }

        let view = Arc::new(ReplicantView::new(view_id, replicants));
        self.view.store(view.clone());
        info!(
            "Installed view {} of family '{}' with {} replicant(s)",
            view_id,
            self.key,
            view.len()
        );

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                listener.replicants_changed(&self.key, &view)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Listener of family '{}' failed on view {}: {}", self.key, view_id, e),
                Err(_) => error!("Listener of family '{}' panicked on view {}", self.key, view_id),
            }
        }

        ViewChange::Installed { view_id }
    }
}

impl std::fmt::Debug for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Family")
            .field("key", &self.key)
            .field("view", &self.view.load_full())
            .finish()
    }
}

/// Registry of the proxy families known to this process.
///
/// Deliveries for different keys may run concurrently; deliveries for the
/// same key are serialized and applied only if their view id is newer than
/// the installed one.
#[derive(Debug, Default)]
pub struct FamilyRegistry {
    families: DashMap<String, Arc<Family>>,
}

impl FamilyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the family for `key`, creating it with an empty view.
    pub fn register(&self, key: &str) -> Arc<Family> {
        self.families
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!("Registered proxy family '{}'", key);
                Arc::new(Family::new(key.to_string()))
            })
            .clone()
    }

    pub fn family(&self, key: &str) -> Option<Arc<Family>> {
        self.families.get(key).map(|f| f.value().clone())
    }

    pub fn view(&self, key: &str) -> Option<Arc<ReplicantView>> {
        self.family(key).map(|f| f.view())
    }

    /// Adds a listener to `key`, registering the family if needed.
    pub fn subscribe(&self, key: &str, listener: Arc<dyn ReplicantListener>) -> Arc<Family> {
        let family = self.register(key);
        family.subscribe(listener);
        family
    }

    /// Membership-change callback for one family.
    ///
    /// Never fails: stale deliveries are reported as [`ViewChange::Stale`]
    /// and listener failures are logged.
    pub fn replicants_changed(
        &self,
        key: &str,
        replicants: Vec<Replicant>,
        view_id: u64,
    ) -> ViewChange {
        // Clone the Arc out so the map shard is not held during delivery
        let family = self.register(key);
        family.install(replicants, view_id)
    }

    pub fn remove_family(&self, key: &str) -> bool {
        let removed = self.families.remove(key).is_some();
        if removed {
            debug!("Removed proxy family '{}'", key);
        }
        removed
    }

    pub fn keys(&self) -> Vec<String> {
        self.families.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }
}
