//! Wire envelope for the `group/1.0` protocol: newline-delimited JSON.
//!
//! `from` is always present on outbound relayed messages (server-stamped)
//! and always ignored on inbound ones — the relay overwrites it with the
//! authenticated remote peer id of the sending stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupMsgType {
    Join,
    Welcome,
    Members,
    Msg,
    State,
    Leave,
    Close,
    Error,
    Ping,
    Pong,
    Meta,
}

/// A single `group/1.0` envelope, as sent on the wire (one JSON object per line).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEnvelope {
    #[serde(rename = "type")]
    pub kind: GroupMsgType,
    pub group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl GroupEnvelope {
    pub fn new(kind: GroupMsgType, group: impl Into<String>) -> Self {
        Self { kind, group: group.into(), from: None, payload: None }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }
}

/// Payload carried by a `welcome` message: current members and opaque state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub members: Vec<MemberInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

/// Payload carried by a `members` broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembersPayload {
    pub members: Vec<MemberInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberInfo {
    pub peer_id: String,
    pub joined_at: i64,
}

/// A peer's local subscription record for a remote group (persisted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSubscription {
    pub host_peer_id: String,
    pub group_id: String,
    pub app_type: String,
    pub role: GroupRole,
    pub subscribed_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Member,
    Admin,
}

/// Group metadata as persisted by the host in storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMeta {
    pub id: String,
    pub name: String,
    pub app_type: String,
    /// 0 = unlimited.
    pub max_members: u32,
    pub volatile: bool,
    pub created_at: i64,
}
