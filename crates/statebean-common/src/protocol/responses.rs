//! Invocation response types.

use serde::{Deserialize, Serialize};

use super::error::{BeanError, Result, WireError};
use super::ids::SessionId;
use super::RequestId;

/// Result value of an invocation.
pub type InvocationResult = serde_json::Value;

/// Response to one [`Request`](super::Request) or admin request.
///
/// `new_session_id` is set whenever the call created a session, whether the
/// call then succeeded or failed: the creation already happened and the
/// client must learn the id either way.
///
/// # Example
///
/// ```
/// use statebean_common::protocol::{Response, SessionId};
/// use serde_json::json;
///
/// let id = SessionId::new();
/// let response = Response::success(7, json!(42)).with_new_session(id);
/// assert!(response.success);
/// assert_eq!(response.new_session_id, Some(id));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    /// Request identifier this response corresponds to
    pub id: RequestId,
    /// Result value (present on success)
    pub result: Option<InvocationResult>,
    /// Structured error (present on failure)
    pub error: Option<WireError>,
    /// Session created as a side effect of this call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<SessionId>,
    pub success: bool,
}

impl Response {
    pub fn success(id: RequestId, result: InvocationResult) -> Self {
        Response {
            id,
            result: Some(result),
            error: None,
            new_session_id: None,
            success: true,
        }
    }

    pub fn error(id: RequestId, error: &BeanError) -> Self {
        Response {
            id,
            result: None,
            error: Some(WireError::from(error)),
            new_session_id: None,
            success: false,
        }
    }

    pub fn with_new_session(mut self, session_id: SessionId) -> Self {
        self.new_session_id = Some(session_id);
        self
    }

    /// Converts the response back into the outcome the server produced.
    pub fn into_result(self) -> Result<InvocationResult> {
        if self.success {
            self.result.ok_or_else(|| {
                BeanError::InvalidResponse("Missing result in success response".to_string())
            })
        } else {
            Err(self
                .error
                .map(BeanError::from)
                .unwrap_or_else(|| BeanError::InvalidResponse("Missing error in failure response".to_string())))
        }
    }
}
