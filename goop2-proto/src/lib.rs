//! Shared types for the goop2 peer mesh.
//!
//! This crate holds everything that both a peer and the rendezvous broker
//! need to agree on: peer identity, presence records, the wire messages for
//! the five named protocols, and the error taxonomy used across the system.
//! It has no networking or storage code of its own.

pub mod chat;
pub mod data;
pub mod docs;
pub mod error;
pub mod group;
pub mod identity;
pub mod msgid;
pub mod presence;

pub use error::{GoopError, GoopResult};
pub use identity::PeerId;
pub use presence::PresenceRecord;
