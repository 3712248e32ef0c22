//! Broker configuration, parsed from CLI args or supplied by an embedding peer.

use std::net::SocketAddr;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "goop2-broker", about = "goop2 rendezvous broker")]
pub struct BrokerConfig {
    /// Address to bind the HTTP listener on.
    #[arg(long, env = "GOOP2_BROKER_BIND", default_value = "127.0.0.1:7420")]
    pub bind: String,

    /// Presence TTL in milliseconds. Peers not refreshed within this window
    /// are evicted and reported as `offline`.
    #[arg(long, env = "GOOP2_BROKER_TTL_MS", default_value_t = 20_000)]
    pub ttl_ms: i64,

    /// Capacity of each SSE subscriber's pending-event ring. Overflow drops
    /// the oldest event; publishers never block on a slow subscriber.
    #[arg(long, default_value_t = 64)]
    pub subscriber_ring: usize,

    /// Optional path to a SQLite file used as a durable mirror of the peer
    /// table. Multiple broker instances pointed at the same file converge
    /// within one sync cycle.
    #[arg(long, env = "GOOP2_BROKER_DB")]
    pub mirror_path: Option<String>,

    /// Durable mirror sync interval, in seconds.
    #[arg(long, default_value_t = 3)]
    pub mirror_sync_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7420".to_string(),
            ttl_ms: 20_000,
            subscriber_ring: 64,
            mirror_path: None,
            mirror_sync_secs: 3,
        }
    }
}

impl BrokerConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind
            .parse()
            .unwrap_or_else(|_| "127.0.0.1:7420".parse().unwrap())
    }
}
