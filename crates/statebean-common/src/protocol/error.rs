use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::ids::{MethodHash, SessionId};

/// Why a session lookup found nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotFoundReason {
    /// The id was never seen by this container (or was forgotten long ago)
    Unknown,
    /// The session was explicitly removed
    Removed,
    /// The session was removed by the idle-timeout scan
    Expired,
}

impl fmt::Display for NotFoundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotFoundReason::Unknown => f.write_str("unknown session"),
            NotFoundReason::Removed => f.write_str("session removed"),
            NotFoundReason::Expired => f.write_str("session expired"),
        }
    }
}

#[derive(Error, Debug)]
pub enum BeanError {
    #[error("Deployment error: {0}")]
    Deployment(String),

    #[error("Unknown method {hash} on container '{container}'")]
    UnknownMethod { container: String, hash: MethodHash },

    #[error("Session {id} not found: {reason}")]
    ContextNotFound { id: SessionId, reason: NotFoundReason },

    #[error("Session {id} is busy: not acquired after {waited_ms}ms")]
    ConcurrentAccess { id: SessionId, waited_ms: u64 },

    #[error("Instantiation error: {0}")]
    Instantiation(String),

    #[error("Application error: {0}")]
    Application(String),

    #[error("Passivation error: {0}")]
    Passivation(String),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Unreachable: {0}")]
    Unreachable(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("No replicants available for family '{0}'")]
    NoReplicants(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BeanError {
    /// Whether the failure came from the network rather than the container.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            BeanError::Unreachable(_)
                | BeanError::Connection(_)
                | BeanError::Timeout(_)
                | BeanError::Io(_)
        )
    }

    /// Whether the request never left this process.
    ///
    /// Only these errors let a clustered proxy try another replicant. A
    /// failure after the request was written may follow a call that already
    /// ran on the target.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, BeanError::Unreachable(_))
    }

    pub fn application(message: impl Into<String>) -> Self {
        BeanError::Application(message.into())
    }
}

pub type Result<T> = std::result::Result<T, BeanError>;

/// Serializable form of [`BeanError`] carried in responses.
///
/// Variants the client must tell apart keep their structure; the rest travel
/// as a kind tag plus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireError {
    Deployment { message: String },
    UnknownMethod { container: String, hash: MethodHash },
    ContextNotFound { id: SessionId, reason: NotFoundReason },
    ConcurrentAccess { id: SessionId, waited_ms: u64 },
    Instantiation { message: String },
    Application { message: String },
    Passivation { message: String },
    InvalidRequest { message: String },
    Internal { message: String },
}

impl From<&BeanError> for WireError {
    fn from(err: &BeanError) -> Self {
        match err {
            BeanError::Deployment(m) => WireError::Deployment { message: m.clone() },
            BeanError::UnknownMethod { container, hash } => WireError::UnknownMethod {
                container: container.clone(),
                hash: *hash,
            },
            BeanError::ContextNotFound { id, reason } => WireError::ContextNotFound {
                id: *id,
                reason: *reason,
            },
            BeanError::ConcurrentAccess { id, waited_ms } => WireError::ConcurrentAccess {
                id: *id,
                waited_ms: *waited_ms,
            },
            BeanError::Instantiation(m) => WireError::Instantiation { message: m.clone() },
            BeanError::Application(m) => WireError::Application { message: m.clone() },
            BeanError::Passivation(m) => WireError::Passivation { message: m.clone() },
            BeanError::InvalidRequest(m) => WireError::InvalidRequest { message: m.clone() },
            other => WireError::Internal { message: other.to_string() },
        }
    }
}

impl From<WireError> for BeanError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Deployment { message } => BeanError::Deployment(message),
            WireError::UnknownMethod { container, hash } => BeanError::UnknownMethod { container, hash },
            WireError::ContextNotFound { id, reason } => BeanError::ContextNotFound { id, reason },
            WireError::ConcurrentAccess { id, waited_ms } => BeanError::ConcurrentAccess { id, waited_ms },
            WireError::Instantiation { message } => BeanError::Instantiation(message),
            WireError::Application { message } => BeanError::Application(message),
            WireError::Passivation { message } => BeanError::Passivation(message),
            WireError::InvalidRequest { message } => BeanError::InvalidRequest(message),
            // Server-side internal failures are not connection failures from the
            // client's point of view: the call reached the server.
            WireError::Internal { message } => BeanError::Transport(message),
        }
    }
}
