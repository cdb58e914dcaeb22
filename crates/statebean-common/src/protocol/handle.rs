//! Detachable session handles.
//!
//! A [`Handle`] is everything needed to reconnect to a live session later,
//! possibly from another process: which container, which session, and
//! whether the container is clustered. It carries no behavior of its own;
//! resolution back into a context happens in the container registry.

use serde::{Deserialize, Serialize};

use super::error::{BeanError, Result};
use super::ids::SessionId;

/// Current handle encoding version.
pub const HANDLE_VERSION: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handle {
    pub version: u16,
    /// Container (bean) name the session lives in
    pub container: String,
    pub session_id: SessionId,
    pub clustered: bool,
    /// Proxy family for clustered containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
}

impl Handle {
    pub fn new(container: impl Into<String>, session_id: SessionId) -> Self {
        Self {
            version: HANDLE_VERSION,
            container: container.into(),
            session_id,
            clustered: false,
            family: None,
        }
    }

    pub fn clustered(container: impl Into<String>, session_id: SessionId, family: impl Into<String>) -> Self {
        Self {
            version: HANDLE_VERSION,
            container: container.into(),
            session_id,
            clustered: true,
            family: Some(family.into()),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a handle, rejecting encodings from a newer version.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let handle: Handle = serde_json::from_slice(data)?;
        if handle.version == 0 || handle.version > HANDLE_VERSION {
            return Err(BeanError::InvalidRequest(format!(
                "Unsupported handle version {} (max {})",
                handle.version, HANDLE_VERSION
            )));
        }
        Ok(handle)
    }

    /// Whether both handles name the same session of the same container.
    pub fn is_identical(&self, other: &Handle) -> bool {
        self.container == other.container && self.session_id == other.session_id
    }
}
