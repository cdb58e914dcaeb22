use crate::protocol::error::Result;
use crate::protocol::{Envelope, Response};

/// Codec for encoding/decoding wire messages
///
/// Only JSON is supported; the enum leaves room for a binary format later.
///
/// # Example
///
/// ```
/// use statebean_common::transport::Codec;
/// use statebean_common::protocol::{AdminRequest, Envelope};
///
/// let codec = Codec::new();
/// let envelope = Envelope::Admin(AdminRequest::new("_info"));
///
/// let encoded = codec.encode_envelope(&envelope).unwrap();
/// let decoded = codec.decode_envelope(&encoded).unwrap();
/// assert_eq!(envelope, decoded);
/// ```
pub enum Codec {
    /// JSON codec (currently the only supported format)
    Json(JsonCodec),
}

impl Codec {
    pub fn new() -> Self {
        Codec::Json(JsonCodec)
    }

    pub fn encode_envelope(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        match self {
            Codec::Json(_) => JsonCodec::encode_envelope(envelope),
        }
    }

    pub fn decode_envelope(&self, data: &[u8]) -> Result<Envelope> {
        match self {
            Codec::Json(_) => JsonCodec::decode_envelope(data),
        }
    }

    pub fn encode_response(&self, response: &Response) -> Result<Vec<u8>> {
        match self {
            Codec::Json(_) => JsonCodec::encode_response(response),
        }
    }

    pub fn decode_response(&self, data: &[u8]) -> Result<Response> {
        match self {
            Codec::Json(_) => JsonCodec::decode_response(data),
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

/// JSON codec for wire messages.
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(envelope)?)
    }

    pub fn decode_envelope(data: &[u8]) -> Result<Envelope> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(response)?)
    }

    pub fn decode_response(data: &[u8]) -> Result<Response> {
        Ok(serde_json::from_slice(data)?)
    }
}
