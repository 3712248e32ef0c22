//! Presence records: the broker's and the presence client's shared currency.

use crate::identity::PeerId;
use serde::{Deserialize, Serialize};

/// Maximum accepted length of `peer_id`, per the broker's `/publish` validation.
pub const MAX_PEER_ID_LEN: usize = 256;
/// Maximum accepted length of `label`, per the broker's `/publish` validation.
pub const MAX_LABEL_LEN: usize = 4096;
/// Maximum accepted body size for `/publish`.
pub const MAX_PUBLISH_BODY_BYTES: usize = 64 * 1024;

/// The lifecycle event a presence publish carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceEventType {
    Online,
    Update,
    Offline,
}

/// Wire body for `POST /publish`: camelCase on the wire, snake_case in Rust.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishBody {
    #[serde(rename = "type")]
    pub kind: PresenceEventType,
    #[serde(rename = "peerID")]
    pub peer_id: String,
    pub content: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, rename = "avatarHash")]
    pub avatar_hash: Option<String>,
    pub ts: i64,
}

/// A peer's presence as stored by the broker and by a peer's local peer table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceRecord {
    pub peer_id: PeerId,
    pub label: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_hash: Option<String>,
    /// Monotonic milliseconds since epoch, as reported by the publisher.
    pub timestamp: i64,
}

impl PresenceRecord {
    pub fn from_publish(body: &PublishBody) -> Self {
        Self {
            peer_id: PeerId::new(body.peer_id.clone()),
            label: body.content.clone(),
            email: body.email.clone(),
            avatar_hash: body.avatar_hash.clone(),
            timestamp: body.ts,
        }
    }

    /// True when `now_ms - timestamp > ttl_ms`.
    pub fn is_stale(&self, now_ms: i64, ttl_ms: i64) -> bool {
        now_ms.saturating_sub(self.timestamp) > ttl_ms
    }
}

/// An event pushed to SSE subscribers / presence-client listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PresenceEvent {
    Snapshot { peers: Vec<PresenceRecord> },
    Online { peer: PresenceRecord },
    Update { peer: PresenceRecord },
    Offline { peer_id: PeerId },
}

pub fn validate_publish(body: &PublishBody) -> Result<(), crate::error::GoopError> {
    if body.peer_id.is_empty() || body.peer_id.len() > MAX_PEER_ID_LEN {
        return Err(crate::error::GoopError::BadRequest(format!(
            "peerID must be 1..={MAX_PEER_ID_LEN} chars"
        )));
    }
    if body.content.len() > MAX_LABEL_LEN {
        return Err(crate::error::GoopError::BadRequest(format!(
            "label must be <= {MAX_LABEL_LEN} chars"
        )));
    }
    Ok(())
}
