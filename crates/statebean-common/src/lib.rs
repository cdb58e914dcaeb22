//! statebean common types and transport
//!
//! Shared by every statebean crate:
//!
//! - **Identity**: [`SessionId`], [`MethodSignature`] / [`MethodHash`]
//! - **References**: the detachable, versioned [`Handle`]
//! - **Protocol**: [`Request`], [`Response`], [`Envelope`] and the
//!   [`BeanError`] taxonomy with its wire form [`WireError`]
//! - **Transport**: length-prefixed JSON over TCP
//!
//! # Example
//!
//! ```
//! use statebean_common::{MethodSignature, Request, Response, SessionId};
//! use serde_json::json;
//!
//! let method = MethodSignature::new("add_item", &["String"]).hash();
//! let request = Request::new("cart", method, json!(["apple"]))
//!     .with_session(SessionId::new())
//!     .with_timeout(5000);
//!
//! let response = Response::success(request.id, json!({"items": 1}));
//! assert!(response.success);
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
