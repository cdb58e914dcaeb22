//! Stateful session cache.
//!
//! Maps session ids to [`BeanContext`]s, bounded by a maximum number of
//! resident contexts. Over capacity, the least recently used checked-in
//! contexts are passivated to a [`PassivationStore`] and transparently
//! activated again on the next lookup.
//!
//! # Locking
//!
//! The id map sits behind one `parking_lot` mutex whose critical sections
//! never block or await. Each context has its own `tokio` mutex; holding it
//! is what checks a session out. Passivation only ever `try_lock`s a context,
//! so it can never wait on a session in use.

use parking_lot::Mutex;
use statebean_cluster::{ReplicaSource, ReplicatedState, StateReplicator};
use statebean_common::protocol::error::{BeanError, NotFoundReason, Result};
use statebean_common::SessionId;
use statebean_metrics::{CacheStats, CacheStatsSource};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::bean::{Bean, BeanFactory, Lifecycle, LifecycleEvent};
use crate::config::{CacheConfig, ConcurrencyPolicy};
use crate::context::{BeanContext, ContextGuard, ContextInfo};
use crate::store::{FilePassivationStore, MemoryPassivationStore, PassivatedState, PassivationStore};

type SharedContext = Arc<AsyncMutex<BeanContext>>;

/// Map entry for one session.
///
/// Links and bookkeeping live here rather than in the context so they can be
/// read without checking the session out.
struct Slot {
    context: SharedContext,
    in_use: bool,
    resident: bool,
    last_used: Instant,
    tick: u64,
    version: u64,
    parent: Option<SessionId>,
    children: Vec<SessionId>,
}

impl Slot {
    fn new(context: SharedContext, tick: u64, version: u64, parent: Option<SessionId>) -> Self {
        Self {
            context,
            in_use: true,
            resident: true,
            last_used: Instant::now(),
            tick,
            version,
            parent,
            children: Vec::new(),
        }
    }
}

/// Bounded memory of why ids disappeared.
struct Tombstones {
    order: VecDeque<SessionId>,
    reasons: HashMap<SessionId, NotFoundReason>,
    capacity: usize,
}

impl Tombstones {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            reasons: HashMap::new(),
            capacity,
        }
    }

    fn record(&mut self, id: SessionId, reason: NotFoundReason) {
        if self.capacity == 0 {
            return;
        }
        if self.reasons.insert(id, reason).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.reasons.remove(&oldest);
            }
        }
    }

    fn reason(&self, id: &SessionId) -> NotFoundReason {
        self.reasons.get(id).copied().unwrap_or(NotFoundReason::Unknown)
    }
}

struct CacheState {
    entries: HashMap<SessionId, Slot>,
    resident: usize,
    tick: u64,
    tombstones: Tombstones,
    running: bool,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    removed: AtomicU64,
    passivated: AtomicU64,
    activated: AtomicU64,
}

/// Outcome of one idle scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub passivated: usize,
    pub expired: usize,
}

/// How a removal acquires the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acquire {
    /// Per the configured concurrency policy
    Policy,
    /// Skip sessions that are checked out
    Try,
}

/// Builder for [`StatefulCache`].
pub struct CacheBuilder {
    container: String,
    config: CacheConfig,
    factory: Arc<dyn BeanFactory>,
    lifecycle: Lifecycle,
    concurrency: ConcurrencyPolicy,
    store: Option<Arc<dyn PassivationStore>>,
    replicator: Option<Arc<dyn StateReplicator>>,
    replicas: Option<Arc<dyn ReplicaSource>>,
}

impl CacheBuilder {
    pub fn lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn concurrency(mut self, policy: ConcurrencyPolicy) -> Self {
        self.concurrency = policy;
        self
    }

    /// Overrides the store chosen from `passivation_dir`.
    pub fn store(mut self, store: Arc<dyn PassivationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn replicator(mut self, replicator: Arc<dyn StateReplicator>) -> Self {
        self.replicator = Some(replicator);
        self
    }

    pub fn replica_source(mut self, source: Arc<dyn ReplicaSource>) -> Self {
        self.replicas = Some(source);
        self
    }

    pub fn build(self) -> Result<Arc<StatefulCache>> {
        self.config.validate()?;
        let store: Arc<dyn PassivationStore> = match (self.store, &self.config.passivation_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(FilePassivationStore::open(dir.join(&self.container))?),
            (None, None) => Arc::new(MemoryPassivationStore::new()),
        };

        Ok(Arc::new(StatefulCache {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                resident: 0,
                tick: 0,
                tombstones: Tombstones::new(self.config.tombstone_capacity),
                running: true,
            }),
            counters: Counters::default(),
            container: self.container,
            config: self.config,
            factory: self.factory,
            lifecycle: self.lifecycle,
            concurrency: self.concurrency,
            store,
            replicator: self.replicator,
            replicas: self.replicas,
        }))
    }
}

/// The session cache of one container.
pub struct StatefulCache {
    container: String,
    config: CacheConfig,
    factory: Arc<dyn BeanFactory>,
    lifecycle: Lifecycle,
    concurrency: ConcurrencyPolicy,
    store: Arc<dyn PassivationStore>,
    replicator: Option<Arc<dyn StateReplicator>>,
    replicas: Option<Arc<dyn ReplicaSource>>,
    state: Mutex<CacheState>,
    counters: Counters,
}

impl StatefulCache {
    pub fn builder(
        container: impl Into<String>,
        config: CacheConfig,
        factory: Arc<dyn BeanFactory>,
    ) -> CacheBuilder {
        CacheBuilder {
            container: container.into(),
            config,
            factory,
            lifecycle: Lifecycle::default(),
            concurrency: ConcurrencyPolicy::default(),
            store: None,
            replicator: None,
            replicas: None,
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn PassivationStore> {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(BeanError::Deployment(format!(
                "container '{}' is stopped",
                self.container
            )))
        }
    }

    fn not_found(&self, id: SessionId) -> BeanError {
        let reason = self.state.lock().tombstones.reason(&id);
        BeanError::ContextNotFound { id, reason }
    }

    /// Creates a session and returns it checked out.
    pub fn create(self: &Arc<Self>, init: Value) -> Result<ContextGuard> {
        self.insert_new(init, None)
    }

    /// Creates a session owned by `parent`. Removing the parent removes it.
    pub fn create_nested(self: &Arc<Self>, parent: SessionId, init: Value) -> Result<ContextGuard> {
        self.insert_new(init, Some(parent))
    }

    fn insert_new(self: &Arc<Self>, init: Value, parent: Option<SessionId>) -> Result<ContextGuard> {
        self.ensure_running()?;
        if let Some(parent) = parent {
            if !self.state.lock().entries.contains_key(&parent) {
                return Err(self.not_found(parent));
            }
        }

        let mut bean = self.factory.create(init).map_err(instantiation)?;
        self.lifecycle
            .run(LifecycleEvent::PostConstruct, bean.as_mut())
            .map_err(instantiation)?;

        let id = SessionId::new();
        let mut fresh = BeanContext::new(id, bean, 0);
        // Creation counts as a change so peers hold the session from the start
        fresh.dirty = true;
        let context = Arc::new(AsyncMutex::new(fresh));
        let guard = context
            .clone()
            .try_lock_owned()
            .map_err(|_| BeanError::Instantiation(format!("fresh context {} is locked", id)))?;

        {
            let mut state = self.state.lock();
            if !state.running {
                drop(state);
                return Err(BeanError::Deployment(format!(
                    "container '{}' is stopped",
                    self.container
                )));
            }
            if let Some(parent) = parent {
                match state.entries.get_mut(&parent) {
                    Some(slot) => slot.children.push(id),
                    None => {
                        let reason = state.tombstones.reason(&parent);
                        return Err(BeanError::ContextNotFound { id: parent, reason });
                    }
                }
            }
            let tick = state.next_tick();
            state.entries.insert(id, Slot::new(context, tick, 0, parent));
            state.resident += 1;
        }

        self.counters.created.fetch_add(1, Ordering::Relaxed);
        match parent {
            Some(parent) => debug!("Created session {} in '{}' under {}", id, self.container, parent),
            None => debug!("Created session {} in '{}'", id, self.container),
        }
        self.enforce_capacity();
        Ok(ContextGuard::new(guard, self.clone(), true))
    }

    /// Checks a session out, activating it if passivated.
    ///
    /// `mark_in_use = false` is administrative access: the session is still
    /// locked while the guard lives but its recency is left untouched.
    pub async fn get(self: &Arc<Self>, id: SessionId, mark_in_use: bool) -> Result<ContextGuard> {
        self.ensure_running()?;
        let context = self.state.lock().entries.get(&id).map(|s| s.context.clone());
        let context = match context {
            Some(context) => context,
            None => return self.adopt_replica(id, mark_in_use),
        };

        let mut locked = self.acquire(id, context).await?;
        if locked.removed {
            return Err(self.not_found(id));
        }
        self.catch_up(&mut locked)?;

        {
            let mut state = self.state.lock();
            let tick = state.next_tick();
            if let Some(slot) = state.entries.get_mut(&id) {
                slot.in_use = true;
                if mark_in_use {
                    slot.tick = tick;
                    slot.last_used = Instant::now();
                }
            }
        }

        let mut guard = ContextGuard::new(locked, self.clone(), mark_in_use);
        if let Some(context) = guard.context_mut() {
            if context.instance.is_none() {
                self.activate(context)?;
                self.enforce_capacity();
            }
        }
        Ok(guard)
    }

    /// Explicit check-in; same as dropping the guard.
    pub fn finished(&self, guard: ContextGuard) {
        drop(guard);
    }

    async fn acquire(&self, id: SessionId, context: SharedContext) -> Result<OwnedMutexGuard<BeanContext>> {
        match self.concurrency {
            ConcurrencyPolicy::FailFast => context
                .try_lock_owned()
                .map_err(|_| BeanError::ConcurrentAccess { id, waited_ms: 0 }),
            ConcurrencyPolicy::Block { timeout_ms } => {
                tokio::time::timeout(Duration::from_millis(timeout_ms), context.lock_owned())
                    .await
                    .map_err(|_| BeanError::ConcurrentAccess {
                        id,
                        waited_ms: timeout_ms,
                    })
            }
        }
    }

    fn activate(&self, context: &mut BeanContext) -> Result<()> {
        let id = context.id;
        let saved = PassivatedState::from_bytes(&self.store.load(id)?)?;
        let mut bean = self.factory.restore(saved.bean_state).map_err(|e| {
            BeanError::Passivation(format!("cannot restore session {}: {}", id, e))
        })?;
        self.lifecycle.run(LifecycleEvent::PostActivate, bean.as_mut())?;

        context.instance = Some(bean);
        context.version = saved.version;
        if let Err(e) = self.store.delete(id) {
            warn!("Failed to delete passivated state of {}: {}", id, e);
        }

        {
            let mut state = self.state.lock();
            if let Some(slot) = state.entries.get_mut(&id) {
                if !slot.resident {
                    slot.resident = true;
                    state.resident += 1;
                }
            }
        }
        self.counters.activated.fetch_add(1, Ordering::Relaxed);
        debug!("Activated session {} in '{}'", id, self.container);
        Ok(())
    }

    /// A replica newer than `version`, left by a peer that took the session
    /// over after this node last served it.
    fn newer_replica(&self, id: SessionId, version: u64) -> Option<ReplicatedState> {
        self.replicas
            .as_ref()
            .and_then(|source| source.peek(&self.container, id))
            .filter(|replica| replica.version > version)
    }

    fn restore_replica(&self, replica: &ReplicatedState) -> Result<Box<dyn Bean>> {
        let mut bean = self.factory.restore(replica.state.clone()).map_err(|e| {
            BeanError::Passivation(format!(
                "cannot restore replica of {}: {}",
                replica.session_id, e
            ))
        })?;
        self.lifecycle.run(LifecycleEvent::PostActivate, bean.as_mut())?;
        Ok(bean)
    }

    fn release_replica(&self, id: SessionId, version: u64) {
        if let Some(source) = &self.replicas {
            source.release(&self.container, id, version);
        }
    }

    /// Replaces a checked-out local copy that a peer has since superseded.
    fn catch_up(&self, context: &mut BeanContext) -> Result<()> {
        let id = context.id;
        let replica = match self.newer_replica(id, context.version) {
            Some(replica) => replica,
            None => return Ok(()),
        };
        let bean = self.restore_replica(&replica)?;

        let passivated = context.instance.is_none();
        context.instance = Some(bean);
        context.version = replica.version;
        context.dirty = false;
        if passivated {
            if let Err(e) = self.store.delete(id) {
                warn!("Failed to delete passivated state of {}: {}", id, e);
            }
        }

        {
            let mut state = self.state.lock();
            if let Some(slot) = state.entries.get_mut(&id) {
                slot.version = replica.version;
                slot.parent = replica.parent;
                slot.children = replica.children.clone();
                if !slot.resident {
                    slot.resident = true;
                    state.resident += 1;
                }
            }
        }
        self.release_replica(id, replica.version);

        debug!(
            "Session {} in '{}' caught up to version {} from a peer",
            id, self.container, replica.version
        );
        if passivated {
            self.enforce_capacity();
        }
        Ok(())
    }

    /// Takes over a session replicated from another node.
    ///
    /// The replica stays in the source until the session is installed here.
    fn adopt_replica(self: &Arc<Self>, id: SessionId, touch: bool) -> Result<ContextGuard> {
        let replica = match self.newer_replica(id, 0) {
            Some(replica) => replica,
            None => return Err(self.not_found(id)),
        };
        let bean = self.restore_replica(&replica)?;

        let mut context = BeanContext::new(id, bean, replica.version);
        // Re-replicate on check-in so peers learn the new primary's copy
        context.dirty = true;
        let context = Arc::new(AsyncMutex::new(context));
        let guard = context
            .clone()
            .try_lock_owned()
            .map_err(|_| BeanError::ConcurrentAccess { id, waited_ms: 0 })?;

        {
            let mut state = self.state.lock();
            if state.entries.contains_key(&id) {
                return Err(BeanError::ConcurrentAccess { id, waited_ms: 0 });
            }
            let tick = state.next_tick();
            let mut slot = Slot::new(context, tick, replica.version, replica.parent);
            slot.children = replica.children;
            state.entries.insert(id, slot);
            state.resident += 1;
        }
        self.release_replica(id, replica.version);

        info!(
            "Adopted replicated session {} in '{}' at version {}",
            id, self.container, replica.version
        );
        self.enforce_capacity();
        Ok(ContextGuard::new(guard, self.clone(), touch))
    }

    /// Check-in of a guard; called from `ContextGuard::drop`.
    pub(crate) fn check_in(&self, mut context: OwnedMutexGuard<BeanContext>, touch: bool) {
        if context.dirty && !context.removed {
            context.dirty = false;
            context.version += 1;
            self.replicate(&context);
        }
        let id = context.id;
        let version = context.version;

        {
            let mut state = self.state.lock();
            let tick = state.next_tick();
            if let Some(slot) = state.entries.get_mut(&id) {
                slot.in_use = false;
                slot.version = version;
                if touch {
                    slot.tick = tick;
                    slot.last_used = Instant::now();
                }
            }
        }
        drop(context);
        self.enforce_capacity();
    }

    fn replicate(&self, context: &BeanContext) {
        let replicator = match &self.replicator {
            Some(replicator) => replicator,
            None => return,
        };
        let bean = match context.instance.as_deref() {
            Some(bean) => bean,
            None => return,
        };
        let state = match bean.state() {
            Ok(state) => state,
            Err(e) => {
                warn!("Cannot replicate session {}: {}", context.id, e);
                return;
            }
        };
        let (parent, children) = {
            let state = self.state.lock();
            state
                .entries
                .get(&context.id)
                .map(|slot| (slot.parent, slot.children.clone()))
                .unwrap_or_default()
        };

        replicator.replicate(ReplicatedState {
            container: self.container.clone(),
            session_id: context.id,
            version: context.version,
            state,
            parent,
            children,
        });
    }

    /// Passivates least recently used checked-in contexts until the resident
    /// count is back under `max_size`.
    fn enforce_capacity(&self) {
        if !self.config.kind.passivates() {
            return;
        }

        let (excess, candidates) = {
            let state = self.state.lock();
            if state.resident <= self.config.max_size {
                return;
            }
            let mut idle: Vec<(u64, SessionId, SharedContext)> = state
                .entries
                .iter()
                .filter(|(_, slot)| slot.resident && !slot.in_use)
                .map(|(id, slot)| (slot.tick, *id, slot.context.clone()))
                .collect();
            idle.sort_unstable_by_key(|(tick, _, _)| *tick);
            (state.resident - self.config.max_size, idle)
        };

        let mut evicted = 0;
        for (_, id, context) in candidates {
            if evicted == excess {
                break;
            }
            match self.passivate_context(id, &context) {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to passivate session {}: {}", id, e),
            }
        }
        if evicted < excess {
            debug!(
                "Cache '{}' over capacity by {}: remaining contexts are in use",
                self.container,
                excess - evicted
            );
        }
    }

    /// Passivates one session.
    ///
    /// Returns `false` without doing anything when the session is checked out
    /// or already passivated.
    pub fn passivate(&self, id: SessionId) -> Result<bool> {
        self.ensure_running()?;
        if !self.config.kind.passivates() {
            return Ok(false);
        }
        let context = {
            let state = self.state.lock();
            match state.entries.get(&id) {
                None => {
                    let reason = state.tombstones.reason(&id);
                    return Err(BeanError::ContextNotFound { id, reason });
                }
                Some(slot) if slot.in_use || !slot.resident => return Ok(false),
                Some(slot) => slot.context.clone(),
            }
        };
        self.passivate_context(id, &context)
    }

    fn passivate_context(&self, id: SessionId, context: &SharedContext) -> Result<bool> {
        let mut locked = match context.try_lock() {
            Ok(locked) => locked,
            Err(_) => return Ok(false),
        };
        if locked.removed {
            return Ok(false);
        }
        let mut bean = match locked.instance.take() {
            Some(bean) => bean,
            None => return Ok(false),
        };

        let version = locked.version;
        let written = self
            .lifecycle
            .run(LifecycleEvent::PrePassivate, bean.as_mut())
            .and_then(|_| bean.state())
            .and_then(|state| PassivatedState::new(version, state).to_bytes())
            .and_then(|bytes| self.store.store(id, &bytes));
        if let Err(e) = written {
            locked.instance = Some(bean);
            return Err(match e {
                BeanError::Passivation(_) => e,
                other => BeanError::Passivation(format!("session {}: {}", id, other)),
            });
        }
        drop(bean);

        {
            let mut state = self.state.lock();
            if let Some(slot) = state.entries.get_mut(&id) {
                if slot.resident {
                    slot.resident = false;
                    state.resident -= 1;
                }
            }
        }
        self.counters.passivated.fetch_add(1, Ordering::Relaxed);
        debug!("Passivated session {} in '{}'", id, self.container);
        Ok(true)
    }

    /// Removes a session and every session nested under it.
    ///
    /// Removing an unknown id succeeds.
    pub async fn remove(&self, id: SessionId) -> Result<()> {
        self.ensure_running()?;
        self.remove_tree(id, NotFoundReason::Removed, Acquire::Policy).await
    }

    async fn remove_tree(&self, id: SessionId, reason: NotFoundReason, acquire: Acquire) -> Result<()> {
        let mut pending = self.remove_one(id, reason, acquire).await?;
        while let Some(child) = pending.pop() {
            match self.remove_one(child, reason, acquire).await {
                Ok(children) => pending.extend(children),
                Err(e) => warn!("Failed to remove session {} nested under {}: {}", child, id, e),
            }
        }
        Ok(())
    }

    /// Removes one session, returning its children.
    async fn remove_one(
        &self,
        id: SessionId,
        reason: NotFoundReason,
        acquire: Acquire,
    ) -> Result<Vec<SessionId>> {
        let context = match self.state.lock().entries.get(&id) {
            Some(slot) => slot.context.clone(),
            None => return Ok(Vec::new()),
        };
        let mut locked = match acquire {
            Acquire::Policy => self.acquire(id, context).await?,
            Acquire::Try => context
                .try_lock_owned()
                .map_err(|_| BeanError::ConcurrentAccess { id, waited_ms: 0 })?,
        };
        if locked.removed {
            return Ok(Vec::new());
        }

        // Passivated sessions are dropped without pre-destroy
        if let Some(bean) = locked.instance.as_deref_mut() {
            if let Err(e) = self.lifecycle.run(LifecycleEvent::PreDestroy, bean) {
                warn!("Pre-destroy of session {} failed: {}", id, e);
            }
        }
        locked.removed = true;
        locked.instance = None;
        // Waiters woken by the unlock must see why the session is gone
        self.state.lock().tombstones.record(id, reason);
        // A copy a peer has taken over only expires here
        let superseded =
            reason == NotFoundReason::Expired && self.newer_replica(id, locked.version).is_some();
        drop(locked);

        if let Err(e) = self.store.delete(id) {
            warn!("Failed to delete passivated state of {}: {}", id, e);
        }
        if !superseded {
            if let Some(replicator) = &self.replicator {
                replicator.evict(&self.container, id);
            }
            if let Some(source) = &self.replicas {
                source.forget(&self.container, id);
            }
        }

        let children = {
            let mut state = self.state.lock();
            let slot = state.entries.remove(&id);
            let children = match slot {
                Some(slot) => {
                    if slot.resident {
                        state.resident -= 1;
                    }
                    if let Some(parent) = slot.parent {
                        if let Some(parent) = state.entries.get_mut(&parent) {
                            parent.children.retain(|child| *child != id);
                        }
                    }
                    slot.children
                }
                None => Vec::new(),
            };
            children
        };

        self.counters.removed.fetch_add(1, Ordering::Relaxed);
        debug!("Removed session {} from '{}' ({})", id, self.container, reason);
        Ok(children)
    }

    /// One pass of the idle scan.
    ///
    /// Sessions idle past the removal timeout are removed (passivated ones
    /// included); resident sessions idle past `max_age` are passivated.
    /// Checked-out sessions are skipped.
    pub async fn scan(&self) -> ScanReport {
        let mut report = ScanReport::default();
        if !self.is_running() {
            return report;
        }
        let removal_timeout = self.config.removal_timeout();
        let max_age = self.config.max_age().filter(|_| self.config.kind.passivates());

        let (expired, stale) = {
            let state = self.state.lock();
            let now = Instant::now();
            let mut expired = Vec::new();
            let mut stale = Vec::new();
            for (id, slot) in state.entries.iter().filter(|(_, slot)| !slot.in_use) {
                let idle = now.saturating_duration_since(slot.last_used);
                if removal_timeout.map(|t| idle >= t).unwrap_or(false) {
                    expired.push(*id);
                } else if slot.resident && max_age.map(|t| idle >= t).unwrap_or(false) {
                    stale.push((*id, slot.context.clone()));
                }
            }
            (expired, stale)
        };

        for id in expired {
            match self.remove_tree(id, NotFoundReason::Expired, Acquire::Try).await {
                Ok(()) => report.expired += 1,
                Err(e) => debug!("Skipped expiring session {}: {}", id, e),
            }
        }
        for (id, context) in stale {
            match self.passivate_context(id, &context) {
                Ok(true) => report.passivated += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to passivate idle session {}: {}", id, e),
            }
        }
        report
    }

    /// Runs [`scan`](Self::scan) every `check_interval` until the cache is
    /// stopped or dropped.
    pub fn spawn_scanner(self: &Arc<Self>) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        let period = self.config.check_interval();
        let container = self.container.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let cache = match cache.upgrade() {
                    Some(cache) if cache.is_running() => cache,
                    _ => break,
                };
                let report = cache.scan().await;
                if report != ScanReport::default() {
                    debug!(
                        "Idle scan of '{}': {} passivated, {} expired",
                        container, report.passivated, report.expired
                    );
                }
            }
            debug!("Idle scanner of '{}' stopped", container);
        })
    }

    /// Re-opens a stopped cache.
    pub fn start(&self) {
        self.state.lock().running = true;
    }

    /// Removes every session (running pre-destroy on resident ones) and
    /// clears the passivation store. Later calls fail with `Deployment`.
    pub async fn stop(&self) -> Result<()> {
        let ids: Vec<SessionId> = {
            let mut state = self.state.lock();
            if !state.running {
                return Ok(());
            }
            state.running = false;
            state.entries.keys().copied().collect()
        };

        let mut failed = 0;
        for id in ids {
            if let Err(e) = self.remove_tree(id, NotFoundReason::Removed, Acquire::Policy).await {
                warn!("Failed to remove session {} while stopping '{}': {}", id, self.container, e);
                failed += 1;
            }
        }
        self.store.clear()?;
        info!("Cache '{}' stopped", self.container);
        if failed > 0 {
            return Err(BeanError::Deployment(format!(
                "{} sessions of '{}' could not be removed",
                failed, self.container
            )));
        }
        Ok(())
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.state.lock().entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn info(&self, id: SessionId) -> Option<ContextInfo> {
        let state = self.state.lock();
        state.entries.get(&id).map(|slot| ContextInfo {
            id,
            in_use: slot.in_use,
            passivated: !slot.resident,
            version: slot.version,
            parent: slot.parent,
            children: slot.children.clone(),
            idle: slot.last_used.elapsed(),
        })
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let available = state
            .entries
            .values()
            .filter(|slot| slot.resident && !slot.in_use)
            .count();
        CacheStats {
            create_count: self.counters.created.load(Ordering::Relaxed),
            remove_count: self.counters.removed.load(Ordering::Relaxed),
            passivate_count: self.counters.passivated.load(Ordering::Relaxed),
            activate_count: self.counters.activated.load(Ordering::Relaxed),
            current_size: state.entries.len(),
            resident_size: state.resident,
            available_count: available,
            max_size: self.config.max_size,
        }
    }
}

impl CacheStatsSource for StatefulCache {
    fn cache_stats(&self) -> CacheStats {
        self.stats()
    }
}

impl std::fmt::Debug for StatefulCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatefulCache")
            .field("container", &self.container)
            .field("kind", &self.config.kind)
            .field("max_size", &self.config.max_size)
            .finish()
    }
}

fn instantiation(e: BeanError) -> BeanError {
    match e {
        BeanError::Instantiation(_) => e,
        other => BeanError::Instantiation(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bean::test_support::*;
    use crate::config::CacheKind;
    use serde_json::json;
    use statebean_common::MethodSignature;

    fn cache(max_size: usize) -> Arc<StatefulCache> {
        StatefulCache::builder(
            "counter",
            CacheConfig::new().with_max_size(max_size),
            counter_factory(),
        )
        .concurrency(ConcurrencyPolicy::FailFast)
        .build()
        .unwrap()
    }

    fn add(guard: &mut ContextGuard, n: i64) -> Value {
        let value = guard
            .instance_mut()
            .unwrap()
            .invoke(&MethodSignature::new("add", &["i64"]), json!(n))
            .unwrap();
        guard.mark_dirty();
        value
    }

    #[tokio::test]
    async fn test_create_get_remove() {
        let cache = cache(10);
        let id = cache.create(json!(1)).unwrap().id();
        assert_eq!(cache.stats().available_count, 1);

        {
            let mut guard = cache.get(id, true).await.unwrap();
            assert_eq!(add(&mut guard, 2), json!(3));
            assert!(cache.info(id).unwrap().in_use);
        }
        assert_eq!(cache.info(id).unwrap().version, 2);

        cache.remove(id).await.unwrap();
        assert!(matches!(
            cache.get(id, true).await,
            Err(BeanError::ContextNotFound { reason: NotFoundReason::Removed, .. })
        ));
        // Removing again is silent
        cache.remove(id).await.unwrap();
        assert!(matches!(
            cache.get(SessionId::new(), true).await,
            Err(BeanError::ContextNotFound { reason: NotFoundReason::Unknown, .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_construction_inserts_nothing() {
        let lifecycle = Lifecycle::new().on(LifecycleEvent::PostConstruct, |_| {
            Err(BeanError::application("no"))
        });
        let cache = StatefulCache::builder("counter", CacheConfig::new(), counter_factory())
            .lifecycle(lifecycle)
            .build()
            .unwrap();

        assert!(matches!(cache.create(json!(0)), Err(BeanError::Instantiation(_))));
        assert!(cache.is_empty());
        assert_eq!(cache.stats().create_count, 0);
    }

    #[tokio::test]
    async fn test_passivation_is_idempotent_and_skips_checked_out() {
        let cache = cache(10);
        let guard = cache.create(json!(4)).unwrap();
        let id = guard.id();
        assert!(!cache.passivate(id).unwrap(), "checked out");
        drop(guard);

        assert!(cache.passivate(id).unwrap());
        assert!(!cache.passivate(id).unwrap());
        assert_eq!(cache.stats().passivate_count, 1);
        assert!(cache.store().contains(id));

        let mut guard = cache.get(id, true).await.unwrap();
        assert_eq!(add(&mut guard, 1), json!(5));
        assert!(!cache.store().contains(id));
        assert_eq!(cache.stats().activate_count, 1);
    }

    #[tokio::test]
    async fn test_capacity_passivates_least_recently_used() {
        let cache = cache(2);
        let a = cache.create(json!(0)).unwrap().id();
        let b = cache.create(json!(0)).unwrap().id();
        drop(cache.get(a, true).await.unwrap());

        let c = cache.create(json!(0)).unwrap().id();
        assert!(cache.info(b).unwrap().passivated);
        assert!(!cache.info(a).unwrap().passivated);
        assert!(!cache.info(c).unwrap().passivated);
        assert_eq!(cache.stats().resident_size, 2);
    }

    #[tokio::test]
    async fn test_administrative_access_keeps_recency() {
        let cache = cache(2);
        let a = cache.create(json!(0)).unwrap().id();
        let b = cache.create(json!(0)).unwrap().id();
        // Looking at `a` without marking it in use must not save it
        drop(cache.get(a, false).await.unwrap());

        cache.create(json!(0)).unwrap();
        assert!(cache.info(a).unwrap().passivated);
        assert!(!cache.info(b).unwrap().passivated);
    }

    #[tokio::test]
    async fn test_fail_fast_on_checked_out_session() {
        let cache = cache(10);
        let guard = cache.create(json!(0)).unwrap();
        let id = guard.id();
        assert!(matches!(
            cache.get(id, true).await,
            Err(BeanError::ConcurrentAccess { waited_ms: 0, .. })
        ));
        cache.finished(guard);
        assert!(cache.get(id, true).await.is_ok());
    }

    #[tokio::test]
    async fn test_nested_sessions_removed_with_parent() {
        let cache = cache(10);
        let parent = cache.create(json!(0)).unwrap().id();
        let child = cache.create_nested(parent, json!(0)).unwrap().id();
        let grandchild = cache.create_nested(child, json!(0)).unwrap().id();
        assert_eq!(cache.info(parent).unwrap().children, vec![child]);
        assert_eq!(cache.info(grandchild).unwrap().parent, Some(child));

        cache.remove(parent).await.unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().remove_count, 3);

        assert!(matches!(
            cache.create_nested(parent, json!(0)),
            Err(BeanError::ContextNotFound { reason: NotFoundReason::Removed, .. })
        ));
    }

    #[tokio::test]
    async fn test_removing_child_unlinks_it() {
        let cache = cache(10);
        let parent = cache.create(json!(0)).unwrap().id();
        let child = cache.create_nested(parent, json!(0)).unwrap().id();
        cache.remove(child).await.unwrap();
        assert!(cache.info(parent).unwrap().children.is_empty());
    }

    #[tokio::test]
    async fn test_scan_expires_and_passivates() {
        let config = CacheConfig::new()
            .with_max_age(Some(Duration::ZERO))
            .with_removal_timeout(None);
        let cache = StatefulCache::builder("counter", config, counter_factory())
            .build()
            .unwrap();
        let id = cache.create(json!(0)).unwrap().id();
        let busy = cache.create(json!(0)).unwrap();

        let report = cache.scan().await;
        assert_eq!(report, ScanReport { passivated: 1, expired: 0 });
        assert!(cache.info(id).unwrap().passivated);
        assert!(!cache.info(busy.id()).unwrap().passivated);
        drop(busy);

        let config = CacheConfig::new()
            .with_kind(CacheKind::NoPassivation)
            .with_removal_timeout(Some(Duration::ZERO));
        let cache = StatefulCache::builder("counter", config, counter_factory())
            .build()
            .unwrap();
        let id = cache.create(json!(0)).unwrap().id();
        assert_eq!(cache.scan().await.expired, 1);
        assert!(matches!(
            cache.get(id, true).await,
            Err(BeanError::ContextNotFound { reason: NotFoundReason::Expired, .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_rejects_later_calls() {
        let cache = cache(10);
        let id = cache.create(json!(0)).unwrap().id();
        cache.passivate(id).unwrap();

        cache.stop().await.unwrap();
        assert!(cache.is_empty());
        assert!(!cache.store().contains(id));
        assert!(matches!(cache.create(json!(0)), Err(BeanError::Deployment(_))));
        assert!(matches!(cache.get(id, true).await, Err(BeanError::Deployment(_))));

        cache.start();
        assert!(cache.create(json!(0)).is_ok());
    }

    #[tokio::test]
    async fn test_replicates_and_adopts_sessions() {
        use statebean_cluster::{ReplicaStore, ReplicationGroup, ReplicationMode};

        let peer = Arc::new(ReplicaStore::new("node2"));
        let group = Arc::new(ReplicationGroup::new("node1", ReplicationMode::Sync));
        group.add_peer(peer.clone());
        let primary = StatefulCache::builder("counter", CacheConfig::new(), counter_factory())
            .replicator(group)
            .build()
            .unwrap();
        let backup = StatefulCache::builder("counter", CacheConfig::new(), counter_factory())
            .replica_source(peer.clone())
            .build()
            .unwrap();

        let id = primary.create(json!(1)).unwrap().id();
        assert_eq!(peer.get("counter", id).unwrap().version, 1);
        {
            let mut guard = primary.get(id, true).await.unwrap();
            add(&mut guard, 4);
        }
        let replica = peer.get("counter", id).unwrap();
        assert_eq!(replica.version, 2);
        assert_eq!(replica.state, json!({ "count": 5 }));

        // The backup misses locally and takes the replica over
        let mut guard = backup.get(id, true).await.unwrap();
        assert_eq!(add(&mut guard, 1), json!(6));
        drop(guard);
        assert!(peer.get("counter", id).is_none());
        assert_eq!(backup.info(id).unwrap().version, 3);

        primary.remove(id).await.unwrap();
        assert!(backup.contains(id));
    }

    /// Two caches replicating into each other's stores.
    fn replicated_pair(
        mode: statebean_cluster::ReplicationMode,
    ) -> (
        Arc<StatefulCache>,
        Arc<StatefulCache>,
        Arc<statebean_cluster::ReplicaStore>,
        Arc<statebean_cluster::ReplicaStore>,
    ) {
        use statebean_cluster::{ReplicaStore, ReplicationGroup};

        let store_a = Arc::new(ReplicaStore::new("node1"));
        let store_b = Arc::new(ReplicaStore::new("node2"));
        let group_a = Arc::new(ReplicationGroup::new("node1", mode));
        let group_b = Arc::new(ReplicationGroup::new("node2", mode));
        group_a.add_peer(store_b.clone());
        group_b.add_peer(store_a.clone());

        let a = StatefulCache::builder("counter", CacheConfig::new(), counter_factory())
            .replicator(group_a)
            .replica_source(store_a.clone())
            .build()
            .unwrap();
        let b = StatefulCache::builder("counter", CacheConfig::new(), counter_factory())
            .replicator(group_b)
            .replica_source(store_b.clone())
            .build()
            .unwrap();
        (a, b, store_a, store_b)
    }

    #[tokio::test]
    async fn test_alternating_nodes_serve_latest_state() {
        let (a, b, store_a, store_b) = replicated_pair(statebean_cluster::ReplicationMode::Sync);
        let id = a.create(json!(1)).unwrap().id();

        {
            let mut guard = b.get(id, true).await.unwrap();
            assert_eq!(add(&mut guard, 4), json!(5));
        }
        // node1 still holds version 1 but its store has node2's version 2
        {
            let mut guard = a.get(id, true).await.unwrap();
            assert_eq!(add(&mut guard, 1), json!(6));
        }
        assert!(store_a.is_empty());
        assert_eq!(a.info(id).unwrap().version, 3);
        {
            let mut guard = b.get(id, true).await.unwrap();
            assert_eq!(add(&mut guard, 1), json!(7));
        }
        assert!(store_b.is_empty());
        assert_eq!(store_a.get("counter", id).unwrap().state, json!({ "count": 7 }));

        // A read on node1 catches up without changing anything
        let mut guard = a.get(id, false).await.unwrap();
        assert_eq!(guard.instance_mut().unwrap().state().unwrap(), json!({ "count": 7 }));
        assert_eq!(guard.version(), 4);
    }

    #[tokio::test]
    async fn test_passivated_copy_catches_up() {
        let (a, b, _, _) = replicated_pair(statebean_cluster::ReplicationMode::Sync);
        let id = a.create(json!(1)).unwrap().id();
        assert!(a.passivate(id).unwrap());

        {
            let mut guard = b.get(id, true).await.unwrap();
            add(&mut guard, 9);
        }

        let mut guard = a.get(id, true).await.unwrap();
        assert_eq!(guard.instance_mut().unwrap().state().unwrap(), json!({ "count": 10 }));
        drop(guard);
        assert!(!a.store().contains(id));
        assert!(!a.info(id).unwrap().passivated);
        assert_eq!(a.stats().resident_size, 1);
    }

    #[tokio::test]
    async fn test_removed_session_stays_removed_under_async_replication() {
        let (a, b, _, store_b) = replicated_pair(statebean_cluster::ReplicationMode::Async);
        let id = a.create(json!(1)).unwrap().id();
        a.remove(id).await.unwrap();

        // Let the queued push land
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(store_b.get("counter", id).is_none());
        assert!(matches!(
            b.get(id, true).await,
            Err(BeanError::ContextNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_adoption_keeps_replica() {
        use statebean_cluster::ReplicaStore;

        let store = Arc::new(ReplicaStore::new("node2"));
        let backup = StatefulCache::builder("counter", CacheConfig::new(), counter_factory())
            .replica_source(store.clone())
            .build()
            .unwrap();
        let id = SessionId::new();
        store.put(ReplicatedState {
            container: "counter".to_string(),
            session_id: id,
            version: 4,
            state: json!("garbage"),
            parent: None,
            children: Vec::new(),
        });

        assert!(matches!(backup.get(id, true).await, Err(BeanError::Passivation(_))));
        assert_eq!(store.get("counter", id).unwrap().version, 4);
        assert!(!backup.contains(id));

        // Once a good copy arrives the session is adopted and released
        let mut good = store.get("counter", id).unwrap();
        good.version = 5;
        good.state = json!({ "count": 3 });
        store.put(good);
        let mut guard = backup.get(id, true).await.unwrap();
        assert_eq!(add(&mut guard, 1), json!(4));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expiring_superseded_copy_keeps_peer_replica() {
        use statebean_cluster::{ReplicaStore, ReplicationGroup, ReplicationMode};

        let own = Arc::new(ReplicaStore::new("node1"));
        let peer = Arc::new(ReplicaStore::new("node2"));
        let group = Arc::new(ReplicationGroup::new("node1", ReplicationMode::Sync));
        group.add_peer(peer.clone());
        let config = CacheConfig::new()
            .with_kind(CacheKind::NoPassivation)
            .with_removal_timeout(Some(Duration::ZERO));
        let cache = StatefulCache::builder("counter", config, counter_factory())
            .replicator(group)
            .replica_source(own.clone())
            .build()
            .unwrap();

        let id = cache.create(json!(1)).unwrap().id();
        // node2 took the session over and replicated version 2 back
        let mut newer = peer.get("counter", id).unwrap();
        newer.version = 2;
        own.put(newer);

        assert_eq!(cache.scan().await.expired, 1);
        assert!(!peer.is_evicted("counter", id));
        assert_eq!(own.get("counter", id).unwrap().version, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_waiter_sees_removed_reason() {
        let cache = StatefulCache::builder("counter", CacheConfig::new(), counter_factory())
            .concurrency(ConcurrencyPolicy::Block { timeout_ms: 5000 })
            .build()
            .unwrap();
        let guard = cache.create(json!(0)).unwrap();
        let id = guard.id();

        let removal = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.remove(id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(id, true).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(guard);

        removal.await.unwrap().unwrap();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(BeanError::ContextNotFound { reason: NotFoundReason::Removed, .. })
        ));
    }

    #[test]
    fn test_tombstones_are_bounded() {
        let mut tombstones = Tombstones::new(2);
        let ids: Vec<SessionId> = (0..3).map(|_| SessionId::new()).collect();
        for id in &ids {
            tombstones.record(*id, NotFoundReason::Expired);
        }
        assert_eq!(tombstones.reason(&ids[0]), NotFoundReason::Unknown);
        assert_eq!(tombstones.reason(&ids[2]), NotFoundReason::Expired);
    }
}
