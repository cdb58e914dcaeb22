//! Invocation dispatcher.
//!
//! Turns one inbound call (method hash, optional session id, arguments) into
//! an [`InvocationResponse`]. Every call walks the same phases:
//!
//! ```text
//! Received -> MethodResolved -> Home | Object | Business
//!          -> ContextAcquired -> Invoked -> ContextReleased
//!          -> ResponseBuilt | ExceptionMarshalled
//! ```
//!
//! Home and object methods that never touch a context skip the acquire,
//! invoke and release phases.

use serde_json::{json, Value};
use statebean_common::protocol::error::{BeanError, Result};
use statebean_common::{Handle, MethodHash, MethodSignature, RequestId, Response, SessionId};
use statebean_metrics::{ContainerMetricsCollector, MetricsCollector};
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

use crate::bean::BeanDescriptor;
use crate::cache::StatefulCache;
use crate::interceptor::{InterceptorChain, Invocation};
use crate::methods::{HomeMethod, MethodInfo, MethodKind, MethodTable, ObjectMethod};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Received,
    MethodResolved,
    Home,
    Object,
    Business,
    ContextAcquired,
    Invoked,
    ContextReleased,
    ResponseBuilt,
    ExceptionMarshalled,
}

/// Outcome of a dispatch plus the id of any session it created.
///
/// `new_session_id` is reported even when the call then failed.
#[derive(Debug)]
pub struct InvocationResponse {
    pub outcome: Result<Value>,
    pub new_session_id: Option<SessionId>,
}

impl InvocationResponse {
    pub fn into_response(self, id: RequestId) -> Response {
        let response = match &self.outcome {
            Ok(value) => Response::success(id, value.clone()),
            Err(e) => Response::error(id, e),
        };
        match self.new_session_id {
            Some(session) => response.with_new_session(session),
            None => response,
        }
    }
}

/// Records the call in the container metrics however the dispatch ends.
struct CallRecord<'a> {
    metrics: &'a ContainerMetricsCollector,
    method: String,
    start: Instant,
    success: bool,
}

impl Drop for CallRecord<'_> {
    fn drop(&mut self) {
        self.metrics.record_call(&self.method, self.start, self.success);
    }
}

struct Phases(Vec<CallPhase>);

impl Phases {
    fn enter(&mut self, phase: CallPhase) {
        trace!("call phase {:?}", phase);
        self.0.push(phase);
    }
}

/// Per-container dispatcher over its cache and method table.
pub struct Dispatcher {
    descriptor: BeanDescriptor,
    table: MethodTable,
    cache: Arc<StatefulCache>,
    interceptors: InterceptorChain,
    metrics: Arc<ContainerMetricsCollector>,
    family: Option<String>,
}

impl Dispatcher {
    pub fn new(
        descriptor: BeanDescriptor,
        cache: Arc<StatefulCache>,
        interceptors: InterceptorChain,
        metrics: Arc<ContainerMetricsCollector>,
        family: Option<String>,
    ) -> Result<Self> {
        let table = MethodTable::build(&descriptor)?;
        Ok(Self {
            descriptor,
            table,
            cache,
            interceptors,
            metrics,
            family,
        })
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn table(&self) -> &MethodTable {
        &self.table
    }

    pub fn handle(&self, id: SessionId) -> Handle {
        match &self.family {
            Some(family) => Handle::clustered(self.name(), id, family.clone()),
            None => Handle::new(self.name(), id),
        }
    }

    pub async fn dispatch(
        &self,
        method: MethodHash,
        session_id: Option<SessionId>,
        args: Value,
    ) -> InvocationResponse {
        self.dispatch_traced(method, session_id, args).await.0
    }

    /// Like [`dispatch`](Self::dispatch), also returning the phases walked.
    pub async fn dispatch_traced(
        &self,
        method: MethodHash,
        session_id: Option<SessionId>,
        args: Value,
    ) -> (InvocationResponse, Vec<CallPhase>) {
        let mut phases = Phases(Vec::with_capacity(8));
        phases.enter(CallPhase::Received);
        let mut record = CallRecord {
            metrics: &self.metrics,
            method: method.to_string(),
            start: Instant::now(),
            success: false,
        };

        let mut new_session_id = None;
        let outcome = match self.table.resolve(method) {
            Ok(info) => {
                phases.enter(CallPhase::MethodResolved);
                record.method = info.signature.canonical();
                self.execute(info, session_id, args, &mut new_session_id, &mut phases)
                    .await
            }
            Err(e) => Err(e),
        };

        record.success = outcome.is_ok();
        phases.enter(if outcome.is_ok() {
            CallPhase::ResponseBuilt
        } else {
            CallPhase::ExceptionMarshalled
        });
        (
            InvocationResponse {
                outcome,
                new_session_id,
            },
            phases.0,
        )
    }

    async fn execute(
        &self,
        info: &MethodInfo,
        session_id: Option<SessionId>,
        args: Value,
        new_session_id: &mut Option<SessionId>,
        phases: &mut Phases,
    ) -> Result<Value> {
        match info.kind {
            MethodKind::Home(home) => {
                phases.enter(CallPhase::Home);
                self.home(home, args, new_session_id, phases).await
            }
            MethodKind::Object(object) => {
                phases.enter(CallPhase::Object);
                let id = session_id.ok_or_else(|| {
                    BeanError::InvalidRequest(format!("{} requires a session id", info.signature))
                })?;
                self.object(object, id, args, phases).await
            }
            MethodKind::Business => {
                phases.enter(CallPhase::Business);
                self.business(&info.signature, session_id, args, new_session_id, phases)
                    .await
            }
        }
    }

    async fn home(
        &self,
        method: HomeMethod,
        args: Value,
        new_session_id: &mut Option<SessionId>,
        phases: &mut Phases,
    ) -> Result<Value> {
        match method {
            HomeMethod::Create => {
                let guard = self.cache.create(args)?;
                let id = guard.id();
                *new_session_id = Some(id);
                phases.enter(CallPhase::ContextAcquired);
                drop(guard);
                phases.enter(CallPhase::ContextReleased);
                Ok(serde_json::to_value(self.handle(id))?)
            }
            HomeMethod::Remove => {
                let handle = self.own_handle(args)?;
                self.cache.remove(handle.session_id).await?;
                Ok(Value::Null)
            }
            HomeMethod::GetMetaData => Ok(self.metadata()),
            HomeMethod::GetHomeHandle => Ok(self.home_handle()),
        }
    }

    async fn object(
        &self,
        method: ObjectMethod,
        id: SessionId,
        args: Value,
        phases: &mut Phases,
    ) -> Result<Value> {
        match method {
            ObjectMethod::Remove => {
                self.cache.remove(id).await?;
                Ok(Value::Null)
            }
            ObjectMethod::GetHandle => {
                // Administrative lookup: proves the session exists without
                // refreshing its recency
                let guard = self.cache.get(id, false).await?;
                phases.enter(CallPhase::ContextAcquired);
                drop(guard);
                phases.enter(CallPhase::ContextReleased);
                Ok(serde_json::to_value(self.handle(id))?)
            }
            ObjectMethod::GetHome => Ok(self.home_handle()),
            ObjectMethod::GetPrimaryKey => Err(BeanError::InvalidRequest(
                "session beans have no primary key".to_string(),
            )),
            ObjectMethod::IsIdentical => {
                let other: Handle = serde_json::from_value(args)?;
                Ok(Value::Bool(self.handle(id).is_identical(&other)))
            }
        }
    }

    async fn business(
        &self,
        method: &MethodSignature,
        session_id: Option<SessionId>,
        args: Value,
        new_session_id: &mut Option<SessionId>,
        phases: &mut Phases,
    ) -> Result<Value> {
        let mut guard = match session_id {
            Some(id) => self.cache.get(id, true).await?,
            None => {
                // Implicit creation for clients that never called create
                let guard = self.cache.create(Value::Null)?;
                *new_session_id = Some(guard.id());
                guard
            }
        };
        phases.enter(CallPhase::ContextAcquired);

        let outcome = {
            let mut invocation = Invocation::new(self.name(), method, args, &mut guard);
            self.interceptors.invoke(&mut invocation)
        };
        phases.enter(CallPhase::Invoked);

        drop(guard);
        phases.enter(CallPhase::ContextReleased);
        outcome
    }

    fn own_handle(&self, args: Value) -> Result<Handle> {
        let handle: Handle = serde_json::from_value(args)?;
        if handle.container != self.name() {
            return Err(BeanError::InvalidRequest(format!(
                "handle of '{}' passed to '{}'",
                handle.container,
                self.name()
            )));
        }
        Ok(handle)
    }

    fn metadata(&self) -> Value {
        let canonical = |kind: fn(&MethodKind) -> bool| -> Vec<String> {
            self.table
                .signatures(kind)
                .into_iter()
                .map(|sig| sig.canonical())
                .collect()
        };
        json!({
            "container": self.name(),
            "clustered": self.family.is_some(),
            "create": canonical(|k| *k == MethodKind::Home(HomeMethod::Create)),
            "business": canonical(|k| *k == MethodKind::Business),
        })
    }

    fn home_handle(&self) -> Value {
        json!({
            "container": self.name(),
            "clustered": self.family.is_some(),
            "family": self.family,
        })
    }
}
