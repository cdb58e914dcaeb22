pub mod error;
pub mod handle;
pub mod ids;
pub mod requests;
pub mod responses;


pub use error::{BeanError, NotFoundReason, Result, WireError};
pub use handle::{Handle, HANDLE_VERSION};
pub use ids::{MethodHash, MethodSignature, SessionId};
pub use requests::{AdminRequest, Envelope, InvocationArgs, Request, RequestId};
pub use responses::{InvocationResult, Response};
