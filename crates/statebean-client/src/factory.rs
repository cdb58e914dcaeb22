//! Proxy factories.
//!
//! A factory hands out proxies for one container: `create_proxy` creates a
//! session first, `create_proxy_for` wraps an id that already exists.
//! Failures building a proxy are returned straight to the caller.

use parking_lot::Mutex;
use serde_json::Value;
use statebean_cluster::{
    ClusterConfig, Family, FamilyRegistry, LoadBalancePolicyKind, Replicant, ReplicantListener,
    ReplicantView,
};
use statebean_common::protocol::error::{BeanError, Result};
use statebean_common::{Handle, MethodSignature, Request, SessionId};
use statebean_container::{BeanDescriptor, Container, ContainerRegistry, HomeMethod};
use std::sync::Arc;
use tracing::{debug, info};

use crate::client::BeanClient;
use crate::pool::ConnectionPool;
use crate::proxy::{ClusteredProxy, LocalProxy, RemoteProxy, SessionHandle};

fn home_signature(method: HomeMethod) -> Result<MethodSignature> {
    method
        .signature()
        .ok_or_else(|| BeanError::InvalidRequest(format!("{:?} has no fixed signature", method)))
}

/// Factory for proxies calling a container in this process.
#[derive(Clone)]
pub struct LocalProxyFactory {
    container: Arc<Container>,
}

impl LocalProxyFactory {
    pub fn new(container: Arc<Container>) -> Self {
        Self { container }
    }

    /// Looks `name` up in a registry; fails with `Deployment` when absent.
    pub fn from_registry(registry: &ContainerRegistry, name: &str) -> Result<Self> {
        registry
            .get(name)
            .map(Self::new)
            .ok_or_else(|| BeanError::Deployment(format!("container '{}' is not deployed", name)))
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    pub fn create_proxy(&self, init: Value) -> Result<LocalProxy> {
        let handle = self.container.create_session(init)?;
        Ok(LocalProxy::new(self.container.clone(), Some(handle.session_id)))
    }

    pub fn create_proxy_for(&self, id: SessionId) -> LocalProxy {
        LocalProxy::new(self.container.clone(), Some(id))
    }
}

impl std::fmt::Debug for LocalProxyFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProxyFactory")
            .field("container", &self.container.name())
            .finish()
    }
}

/// Factory for proxies calling a container behind one locator.
///
/// Sessions are created through the container's home `create` method, so the
/// factory needs nothing but the locator and the container name.
#[derive(Debug, Clone)]
pub struct RemoteProxyFactory {
    client: BeanClient,
    locator: String,
    container: String,
    create: MethodSignature,
}

impl RemoteProxyFactory {
    pub fn new(client: BeanClient, locator: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            client,
            locator: locator.into(),
            container: container.into(),
            create: BeanDescriptor::default_create(),
        }
    }

    /// Uses a create method other than `create(json)`.
    pub fn with_create_method(mut self, create: MethodSignature) -> Self {
        self.create = create;
        self
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub async fn create_proxy(&self, init: Value) -> Result<RemoteProxy> {
        let request = Request::new(self.container.clone(), self.create.hash(), init);
        let response = self.client.invoke(&self.locator, request).await?;
        let session = response.new_session_id;
        response.into_result()?;

        let id = session.ok_or_else(|| {
            BeanError::InvalidResponse(format!("'{}' created no session", self.create))
        })?;
        debug!("Created remote session {} in '{}'", id, self.container);
        Ok(self.create_proxy_for(id))
    }

    pub fn create_proxy_for(&self, id: SessionId) -> RemoteProxy {
        RemoteProxy::new(self.client.clone(), self.locator.clone(), self.container.clone(), Some(id))
    }

    /// The container's metadata document.
    pub async fn metadata(&self) -> Result<Value> {
        self.home_call(HomeMethod::GetMetaData, Value::Null).await
    }

    pub async fn home_handle(&self) -> Result<Handle> {
        let value = self.home_call(HomeMethod::GetHomeHandle, Value::Null).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Removes a session through the home interface.
    pub async fn remove(&self, handle: &Handle) -> Result<()> {
        self.home_call(HomeMethod::Remove, serde_json::to_value(handle)?)
            .await
            .map(|_| ())
    }

    async fn home_call(&self, method: HomeMethod, args: Value) -> Result<Value> {
        let request = Request::new(self.container.clone(), home_signature(method)?.hash(), args);
        self.client
            .invoke(&self.locator, request)
            .await?
            .into_result()
    }
}

/// Closes pooled connections to replicants that left a family's view.
struct ConnectionEvictor {
    pool: Arc<ConnectionPool>,
    known: Mutex<Vec<Replicant>>,
}

impl ReplicantListener for ConnectionEvictor {
    fn replicants_changed(&self, key: &str, view: &ReplicantView) -> Result<()> {
        let mut known = self.known.lock();
        for gone in known.iter().filter(|r| !view.contains(r)) {
            let closed = self.pool.evict(&gone.locator);
            debug!("Replicant {} left family '{}', closed {} connection(s)", gone, key, closed);
        }
        *known = view.replicants().to_vec();
        Ok(())
    }
}

/// Factory for proxies of a clustered container.
///
/// The family is registered in the given [`FamilyRegistry`]; every proxy
/// reads the family's live view and gets its own policy instance.
pub struct ClusteredProxyFactory {
    client: BeanClient,
    family: Arc<Family>,
    policy: LoadBalancePolicyKind,
    container: String,
    create: MethodSignature,
}

impl ClusteredProxyFactory {
    /// Fails with `Deployment` when clustering is disabled in `config`.
    pub fn new(
        client: BeanClient,
        families: &FamilyRegistry,
        container: impl Into<String>,
        config: &ClusterConfig,
    ) -> Result<Self> {
        let container = container.into();
        if !config.enabled {
            return Err(BeanError::Deployment(format!(
                "container '{}' is not clustered",
                container
            )));
        }

        let key = config.family_key(&container);
        let evictor = Arc::new(ConnectionEvictor {
            pool: client.pool().clone(),
            known: Mutex::new(Vec::new()),
        });
        let family = families.subscribe(&key, evictor);
        info!("Clustered proxy factory for '{}' ready ({:?})", key, config.policy);

        Ok(Self {
            client,
            family,
            policy: config.policy,
            container,
            create: BeanDescriptor::default_create(),
        })
    }

    pub fn with_create_method(mut self, create: MethodSignature) -> Self {
        self.create = create;
        self
    }

    pub fn family(&self) -> &Arc<Family> {
        &self.family
    }

    pub fn load_balance_policy(&self) -> LoadBalancePolicyKind {
        self.policy
    }

    /// Creates a session on whichever replicant the policy picks.
    pub async fn create_proxy(&self, init: Value) -> Result<ClusteredProxy> {
        let proxy = self.proxy(None);
        proxy.invoke(&self.create, init).await?;
        if proxy.session_id().is_none() {
            return Err(BeanError::InvalidResponse(format!(
                "'{}' created no session",
                self.create
            )));
        }
        Ok(proxy)
    }

    pub fn create_proxy_for(&self, id: SessionId) -> ClusteredProxy {
        self.proxy(Some(id))
    }

    fn proxy(&self, id: Option<SessionId>) -> ClusteredProxy {
        ClusteredProxy::new(
            self.client.clone(),
            self.family.clone(),
            self.policy.build(),
            self.container.clone(),
            id,
        )
    }
}

impl std::fmt::Debug for ClusteredProxyFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusteredProxyFactory")
            .field("family", &self.family.key())
            .field("policy", &self.policy)
            .field("container", &self.container)
            .finish()
    }
}
