//! goop2 peer runtime: transport, storage, presence, chat, groups, docs,
//! the data proxy, the script engine, and the local HTTP surface.

pub mod chat;
pub mod config;
pub mod content;
pub mod data;
pub mod docs;
pub mod group;
pub mod mq;
pub mod presence;
pub mod script;
pub mod server;
pub mod storage;
pub mod traits;
pub mod transport;
pub mod web;

pub use server::Peer;
