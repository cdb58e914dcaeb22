use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use super::ids::{MethodHash, SessionId};

pub type RequestId = u64;
pub type InvocationArgs = serde_json::Value;

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One inbound invocation: which container, which method, which session.
///
/// `session_id` is `None` for home calls and for the first business call of a
/// client that relies on implicit creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub container: String,
    pub method: MethodHash,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub args: InvocationArgs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Request {
    pub fn new(container: impl Into<String>, method: MethodHash, args: InvocationArgs) -> Self {
        Request {
            id: generate_request_id(),
            container: container.into(),
            method,
            session_id: None,
            args,
            timeout_ms: None,
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Administrative request for a built-in endpoint (`_metrics`, `_info`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminRequest {
    pub id: RequestId,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

impl AdminRequest {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            id: generate_request_id(),
            endpoint: endpoint.into(),
            container: None,
        }
    }

    pub fn for_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }
}

/// Everything a container server accepts on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Invoke(Request),
    Admin(AdminRequest),
}

impl Envelope {
    pub fn id(&self) -> RequestId {
        match self {
            Envelope::Invoke(r) => r.id,
            Envelope::Admin(r) => r.id,
        }
    }
}

fn generate_request_id() -> RequestId {
    // Try to use system time as the base
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    // Always increment the counter to ensure uniqueness
    let counter = REQUEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst);

    // Upper 32 bits from the clock, lower 32 bits from the counter
    (timestamp & 0xFFFFFFFF00000000) | (counter & 0xFFFFFFFF)
}
