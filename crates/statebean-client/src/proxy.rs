//! Client-side session proxies.
//!
//! A proxy binds one session id to an invocation path. [`LocalProxy`] calls
//! a container in the same process, [`RemoteProxy`] talks to one locator and
//! [`ClusteredProxy`] picks a replicant of its family per call, failing over
//! when a target cannot be connected to.
//!
//! Every proxy adopts the `new_session_id` of a response, so a proxy built
//! without a session becomes bound to the one its first call created.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use statebean_cluster::{Family, LoadBalancePolicy, Replicant};
use statebean_common::protocol::error::{BeanError, Result};
use statebean_common::{Handle, MethodSignature, Request, Response, SessionId};
use statebean_container::{Container, ObjectMethod};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::client::BeanClient;

/// A client-usable reference to one session.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    async fn invoke(&self, method: &MethodSignature, args: Value) -> Result<Value>;

    /// The bound session, if any call has bound one yet.
    fn session_id(&self) -> Option<SessionId>;

    fn handle(&self) -> Option<Handle>;

    /// Removes the bound session.
    async fn remove(&self) -> Result<()> {
        self.invoke(&ObjectMethod::Remove.signature(), Value::Null)
            .await
            .map(|_| ())
    }
}

#[derive(Debug, Default)]
struct Binding(Mutex<Option<SessionId>>);

impl Binding {
    fn new(id: Option<SessionId>) -> Self {
        Self(Mutex::new(id))
    }

    fn get(&self) -> Option<SessionId> {
        *self.0.lock()
    }

    fn adopt(&self, new_session: Option<SessionId>) {
        if let Some(id) = new_session {
            let mut bound = self.0.lock();
            if *bound != Some(id) {
                debug!("Proxy bound to new session {}", id);
                *bound = Some(id);
            }
        }
    }
}

/// Proxy for a container in the same process.
pub struct LocalProxy {
    container: Arc<Container>,
    session: Binding,
}

impl LocalProxy {
    pub fn new(container: Arc<Container>, session_id: Option<SessionId>) -> Self {
        Self {
            container,
            session: Binding::new(session_id),
        }
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }
}

#[async_trait]
impl SessionHandle for LocalProxy {
    async fn invoke(&self, method: &MethodSignature, args: Value) -> Result<Value> {
        let response = self
            .container
            .invoke_local(method, self.session.get(), args)
            .await;
        self.session.adopt(response.new_session_id);
        response.outcome
    }

    fn session_id(&self) -> Option<SessionId> {
        self.session.get()
    }

    fn handle(&self) -> Option<Handle> {
        self.session.get().map(|id| self.container.handle(id))
    }
}

impl std::fmt::Debug for LocalProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProxy")
            .field("container", &self.container.name())
            .field("session", &self.session.get())
            .finish()
    }
}

fn build_request(
    container: &str,
    method: &MethodSignature,
    session: Option<SessionId>,
    args: Value,
    timeout_ms: Option<u64>,
) -> Request {
    let mut request = Request::new(container, method.hash(), args);
    if let Some(id) = session {
        request = request.with_session(id);
    }
    if let Some(timeout) = timeout_ms {
        request = request.with_timeout(timeout);
    }
    request
}

/// Proxy for a container behind one locator.
#[derive(Debug)]
pub struct RemoteProxy {
    client: BeanClient,
    locator: String,
    container: String,
    session: Binding,
    timeout_ms: Option<u64>,
}

impl RemoteProxy {
    pub fn new(
        client: BeanClient,
        locator: impl Into<String>,
        container: impl Into<String>,
        session_id: Option<SessionId>,
    ) -> Self {
        Self {
            client,
            locator: locator.into(),
            container: container.into(),
            session: Binding::new(session_id),
            timeout_ms: None,
        }
    }

    /// Deadline hint sent with every request.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn container(&self) -> &str {
        &self.container
    }
}

#[async_trait]
impl SessionHandle for RemoteProxy {
    async fn invoke(&self, method: &MethodSignature, args: Value) -> Result<Value> {
        let request = build_request(&self.container, method, self.session.get(), args, self.timeout_ms);
        let response = self.client.invoke(&self.locator, request).await?;
        self.session.adopt(response.new_session_id);
        response.into_result()
    }

    fn session_id(&self) -> Option<SessionId> {
        self.session.get()
    }

    fn handle(&self) -> Option<Handle> {
        self.session
            .get()
            .map(|id| Handle::new(self.container.clone(), id))
    }
}

/// Proxy for a clustered container.
///
/// Each call takes a snapshot of the family's view and asks the policy for a
/// target. A target that could not be connected to is excluded and the policy
/// asked again. Once the request was written, every failure is returned as is
/// since the call may already have run. Each replicant is tried at most once
/// per call.
pub struct ClusteredProxy {
    client: BeanClient,
    family: Arc<Family>,
    policy: Arc<dyn LoadBalancePolicy>,
    container: String,
    session: Binding,
}

impl ClusteredProxy {
    pub fn new(
        client: BeanClient,
        family: Arc<Family>,
        policy: Arc<dyn LoadBalancePolicy>,
        container: impl Into<String>,
        session_id: Option<SessionId>,
    ) -> Self {
        Self {
            client,
            family,
            policy,
            container: container.into(),
            session: Binding::new(session_id),
        }
    }

    pub fn family(&self) -> &Arc<Family> {
        &self.family
    }

    pub fn policy(&self) -> &Arc<dyn LoadBalancePolicy> {
        &self.policy
    }

    async fn call(&self, method: &MethodSignature, args: Value) -> Result<(Replicant, Response)> {
        let view = self.family.view();
        let mut failed: Vec<Replicant> = Vec::new();

        loop {
            let target = self.policy.choose(&view, &failed).ok_or_else(|| {
                BeanError::NoReplicants(self.family.key().to_string())
            })?;

            let request = build_request(&self.container, method, self.session.get(), args.clone(), None);
            match self.client.invoke(&target.locator, request).await {
                Ok(response) => return Ok((target, response)),
                Err(e) if e.is_unreachable() => {
                    warn!(
                        "Replicant {} of family '{}' unreachable in view {}, failing over: {}",
                        target,
                        self.family.key(),
                        view.view_id(),
                        e
                    );
                    failed.push(target);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl SessionHandle for ClusteredProxy {
    async fn invoke(&self, method: &MethodSignature, args: Value) -> Result<Value> {
        let (target, response) = self.call(method, args).await?;
        debug!("Call {} on family '{}' answered by {}", method.name, self.family.key(), target);
        self.session.adopt(response.new_session_id);
        response.into_result()
    }

    fn session_id(&self) -> Option<SessionId> {
        self.session.get()
    }

    fn handle(&self) -> Option<Handle> {
        self.session
            .get()
            .map(|id| Handle::clustered(self.container.clone(), id, self.family.key()))
    }
}

impl std::fmt::Debug for ClusteredProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusteredProxy")
            .field("family", &self.family.key())
            .field("policy", &self.policy.name())
            .field("container", &self.container)
            .field("session", &self.session.get())
            .finish()
    }
}
