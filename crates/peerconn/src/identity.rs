//! Peer identifiers.
//!
//! A [`PeerId`] names a logical network participant independently of the
//! address it is currently reachable on. Any non-empty string is accepted;
//! identities derived from an Ed25519 public key use the base64url encoding
//! of the 32 key bytes (43 characters, no padding).
//!
//! # Example
//!
//! ```
//! use ed25519_dalek::SigningKey;
//! use peerconn::identity::PeerId;
//!
//! let key = SigningKey::from_bytes(&[7u8; 32]);
//! let id = PeerId::from_public_key(&key.verifying_key());
//! assert_eq!(id.as_str().len(), 43);
//! assert_eq!(id.public_key_bytes().unwrap(), key.verifying_key().to_bytes());
//! ```

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::VerifyingKey;
use peerconn_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque, comparable peer identifier.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive a peer id from raw Ed25519 public key bytes.
    pub fn from_key_bytes(bytes: &[u8; 32]) -> Self {
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Derive a peer id from an Ed25519 verifying key.
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Self::from_key_bytes(key.as_bytes())
    }

    /// Parse a peer id, rejecting empty or whitespace-bearing input.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::identity("empty peer id"));
        }
        if s.chars().any(char::is_whitespace) {
            return Err(Error::identity(format!("peer id contains whitespace: {s:?}")));
        }
        Ok(Self(s.to_string()))
    }

    /// Recover the Ed25519 public key bytes, if this id was derived from one.
    pub fn public_key_bytes(&self) -> Option<[u8; 32]> {
        let bytes = URL_SAFE_NO_PAD.decode(&self.0).ok()?;
        bytes.try_into().ok()
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}
