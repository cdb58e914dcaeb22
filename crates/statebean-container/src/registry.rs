use parking_lot::RwLock;
use statebean_common::protocol::error::{BeanError, Result};
use statebean_common::Handle;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::container::Container;

/// Containers deployed in one process, by name.
///
/// Handles resolve against a registry instance rather than global state, so
/// tests and embedded deployments can run several side by side.
#[derive(Default)]
pub struct ContainerRegistry {
    containers: RwLock<HashMap<String, Arc<Container>>>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, container: Arc<Container>) -> Result<()> {
        let mut containers = self.containers.write();
        if containers.contains_key(container.name()) {
            return Err(BeanError::Deployment(format!(
                "container '{}' is already registered",
                container.name()
            )));
        }
        info!("Registered container '{}'", container.name());
        containers.insert(container.name().to_string(), container);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<Container>> {
        self.containers.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Container>> {
        self.containers.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.containers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.containers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.read().is_empty()
    }

    /// Resolves a handle to its container, checking the session still exists.
    ///
    /// Fails with `Deployment` when the container is gone and with
    /// `ContextNotFound` when the session is. The lookup does not refresh the
    /// session's recency.
    pub async fn resolve_handle(&self, handle: &Handle) -> Result<Arc<Container>> {
        let container = self.get(&handle.container).ok_or_else(|| {
            BeanError::Deployment(format!("container '{}' is not deployed", handle.container))
        })?;
        let guard = container.cache().get(handle.session_id, false).await?;
        drop(guard);
        Ok(container)
    }

    /// Forgets every container without stopping them.
    pub fn clear(&self) {
        self.containers.write().clear();
    }

    /// Stops and unregisters every container.
    pub async fn shutdown(&self) {
        let containers: Vec<Arc<Container>> = self.containers.write().drain().map(|(_, c)| c).collect();
        for container in containers {
            if let Err(e) = container.stop().await {
                warn!("Failed to stop container '{}': {}", container.name(), e);
            }
        }
    }
}

impl std::fmt::Debug for ContainerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRegistry")
            .field("containers", &self.names())
            .finish()
    }
}
