//! Rendezvous broker: an HTTP service that receives presence heartbeats and
//! fans out join/leave/update events to subscribers over SSE.
//!
//! This crate is usable standalone (the `goop2-broker` binary) or embedded
//! by a peer that opts into hosting its own broker (`rendezvous_host = true`
//! in `goop.json`).

pub mod config;
pub mod handlers;
pub mod mirror;
pub mod state;

pub use config::BrokerConfig;
pub use state::BrokerState;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

/// Build the broker's router over the given shared state.
pub fn router(state: Arc<BrokerState>) -> Router {
    Router::new()
        .route("/publish", post(handlers::publish))
        .route("/events", get(handlers::events))
        .route("/peers.json", get(handlers::peers_json))
        .route("/healthz", get(handlers::healthz))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the broker to completion (until the process is killed). Spawns the
/// TTL eviction sweep and, if configured, the durable mirror sync loop.
pub async fn run(config: BrokerConfig) -> Result<()> {
    let state = Arc::new(BrokerState::new(config.clone())?);

    let evict_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        loop {
            tick.tick().await;
            evict_state.evict_stale();
        }
    });

    if let Some(mirror) = state.mirror.clone() {
        let mirror_state = Arc::clone(&state);
        tokio::spawn(async move {
            mirror::sync_loop(mirror, mirror_state).await;
        });
    }

    let app = router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    tracing::info!(addr = %config.bind_addr(), "rendezvous broker listening");
    axum::serve(listener, app).await?;
    Ok(())
}
