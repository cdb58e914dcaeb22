use serde::Serialize;
use statebean_common::protocol::error::{BeanError, Result};
use statebean_common::SessionId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

use crate::bean::Bean;
use crate::cache::StatefulCache;

/// Conversational state of one session.
///
/// Lives behind a per-session async mutex; holding the lock is what makes a
/// session "checked out". `instance` is `None` while passivated.
pub struct BeanContext {
    pub(crate) id: SessionId,
    pub(crate) instance: Option<Box<dyn Bean>>,
    pub(crate) version: u64,
    pub(crate) removed: bool,
    pub(crate) dirty: bool,
}

impl BeanContext {
    pub(crate) fn new(id: SessionId, instance: Box<dyn Bean>, version: u64) -> Self {
        Self {
            id,
            instance: Some(instance),
            version,
            removed: false,
            dirty: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_passivated(&self) -> bool {
        self.instance.is_none()
    }
}

/// Read-only view of a cached session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextInfo {
    pub id: SessionId,
    pub in_use: bool,
    pub passivated: bool,
    pub version: u64,
    pub parent: Option<SessionId>,
    pub children: Vec<SessionId>,
    pub idle: Duration,
}

/// A checked-out session.
///
/// Dropping the guard checks the context back in: the in-use flag clears,
/// recency is refreshed for business access, a dirty context is replicated
/// and the cache gets a chance to passivate over-capacity entries.
pub struct ContextGuard {
    id: SessionId,
    context: Option<OwnedMutexGuard<BeanContext>>,
    cache: Arc<StatefulCache>,
    touch: bool,
}

impl ContextGuard {
    pub(crate) fn new(
        context: OwnedMutexGuard<BeanContext>,
        cache: Arc<StatefulCache>,
        touch: bool,
    ) -> Self {
        Self {
            id: context.id,
            context: Some(context),
            cache,
            touch,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.context.as_ref().map(|c| c.version).unwrap_or_default()
    }

    pub fn instance_mut(&mut self) -> Result<&mut dyn Bean> {
        let id = self.id;
        match self.context.as_mut().and_then(|c| c.instance.as_deref_mut()) {
            Some(bean) => Ok(bean),
            None => Err(BeanError::Passivation(format!(
                "session {} has no active instance",
                id
            ))),
        }
    }

    /// Flags the state as changed so check-in bumps the version and
    /// replicates it.
    pub fn mark_dirty(&mut self) {
        if let Some(context) = self.context.as_mut() {
            context.dirty = true;
        }
    }

    pub(crate) fn context_mut(&mut self) -> Option<&mut BeanContext> {
        self.context.as_deref_mut()
    }
}

impl std::fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextGuard")
            .field("id", &self.id)
            .field("touch", &self.touch)
            .finish()
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            self.cache.check_in(context, self.touch);
        }
    }
}
