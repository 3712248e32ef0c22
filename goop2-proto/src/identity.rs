//! Peer identity.
//!
//! A `PeerId` is the hash of a peer's durable public key. The transport
//! layer (goop2-peer's `transport` module) derives this from the iroh QUIC
//! handshake, so any `PeerId` seen by application code is already
//! authenticated — it is never accepted verbatim from a message payload.

use std::fmt;

/// A peer's durable identity, as a lowercase hex string of its public key hash.
///
/// Cheap to clone, used as a map key everywhere (presence table, group
/// membership, `_owner` column). Equality and hashing are on the string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
