//! Transport Layer
//!
//! TCP transport and codecs for sending invocation envelopes to a container
//! server and receiving responses.
//!
//! # Architecture
//!
//! - **Transport**: TCP with keep-alive connections
//! - **Codec**: JSON serialization for protocol messages
//! - **Wire Format**: `[4-byte length prefix as u32 big-endian] + [JSON data]`
//!
//! # Components
//!
//! - **[`Codec`]** / **[`JsonCodec`]**: Encode/decode envelopes and responses
//! - **[`TcpTransport`]**: Async client side (used by remote proxies)
//! - **[`TcpServer`]**: Async server side (used by container servers)
//!
//! All reads enforce a maximum message size of 100 MB.

pub mod codec;
pub mod tcp;
pub mod tcp_server;

pub use codec::{Codec, JsonCodec};
pub use tcp::{TcpTransport, DEFAULT_TIMEOUT, MAX_MESSAGE_SIZE};
pub use tcp_server::TcpServer;
