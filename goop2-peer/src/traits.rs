//! Narrow interfaces that break the natural cyclic references between
//! components (peer manager ↔ group manager ↔ data proxy ↔ script engine).
//!
//! No component holds a typed back-pointer to another; cross-component
//! calls always go through one of these traits, handed down at
//! construction.

use goop2_proto::presence::PresenceRecord;
use goop2_proto::PeerId;

/// Resolves presence information without depending on the presence client
/// type directly.
pub trait PeerResolver: Send + Sync {
    fn resolve(&self, peer_id: &PeerId) -> Option<PresenceRecord>;
    fn is_presence_visible(&self, peer_id: &PeerId) -> bool;
    fn online_peer_ids(&self) -> Vec<PeerId>;
}

/// Answers "is this peer currently a live member of this group", without
/// the asker needing to depend on `GroupManager` directly.
pub trait GroupMembershipOracle: Send + Sync {
    fn is_member(&self, group_id: &str, peer_id: &PeerId) -> bool;
    /// True if `self_peer_id` and `peer_id` share membership in any group.
    fn shares_a_group_with_self(&self, peer_id: &PeerId) -> bool;
}

/// Publishes a browser-observable event onto the message bus without the
/// publisher depending on `Mq` directly.
pub trait MqPublisher: Send + Sync {
    fn publish_local(&self, topic: String, payload: serde_json::Value);
    fn publish_from(&self, topic: String, payload: serde_json::Value, from: PeerId);
}

/// The local peer's own identity, handed to anything that needs to stamp
/// "this came from me" vs. "this came from a remote caller".
pub trait Identity: Send + Sync {
    fn self_id(&self) -> PeerId;
    fn self_label(&self) -> String;
}

/// Invokes a user script function without the caller depending on the
/// script engine crate directly. `data.rs` forwards `lua-list`/`lua-call`
/// requests through this so the script engine never needs to know about
/// the `data/1.0` wire protocol.
pub trait ScriptOps: Send + Sync {
    fn list_functions(&self) -> Vec<String>;
    fn call<'a>(
        &'a self,
        function: &'a str,
        caller_id: PeerId,
        params: serde_json::Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = goop2_proto::GoopResult<serde_json::Value>> + Send + 'a>>;

    fn list_commands(&self) -> Vec<String>;
    fn call_command<'a>(
        &'a self,
        command: &'a str,
        caller_id: PeerId,
        args: serde_json::Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = goop2_proto::GoopResult<serde_json::Value>> + Send + 'a>>;
}
