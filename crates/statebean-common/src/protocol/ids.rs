//! Session and method identity.
//!
//! A [`SessionId`] names one conversation with a stateful bean. A
//! [`MethodHash`] names one method of a bean interface and is derived from the
//! canonical signature string, so client and server builds agree on it
//! without sharing code.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error::BeanError;

/// Opaque identifier of one stateful session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Allocates a fresh random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = BeanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(SessionId)
            .map_err(|e| BeanError::InvalidRequest(format!("Invalid session id '{}': {}", s, e)))
    }
}

/// A method signature: name plus ordered parameter type names.
///
/// The canonical form is `name(type1,type2)`, which is what gets hashed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodSignature {
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
}

impl MethodSignature {
    pub fn new(name: impl Into<String>, params: &[&str]) -> Self {
        Self {
            name: name.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Canonical signature string, e.g. `deposit(u64,String)`.
    pub fn canonical(&self) -> String {
        format!("{}({})", self.name, self.params.join(","))
    }

    pub fn hash(&self) -> MethodHash {
        MethodHash::of(self)
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Stable 64-bit method identity.
///
/// Computed as the first 8 bytes (big-endian) of SHA-256 over the canonical
/// signature string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MethodHash(pub u64);

impl MethodHash {
    pub fn of(signature: &MethodSignature) -> Self {
        let digest = Sha256::digest(signature.canonical().as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        MethodHash(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for MethodHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
