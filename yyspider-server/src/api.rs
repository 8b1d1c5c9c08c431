//! Status HTTP endpoint
//!
//! Optional read-only view of a running coordinator, served on
//! `status_port` when configured. Exposes no mutating routes.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::server::ServerContext;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct PeerStatus {
    pub name: String,
    pub peer_addr: String,
    pub connected_at: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub started_at: String,
    pub peers: Vec<PeerStatus>,
    pub write_queues: BTreeMap<String, usize>,
    pub pending_stats: usize,
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        module: "yyspider-server".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /status
pub async fn status(State(ctx): State<Arc<ServerContext>>) -> Json<StatusResponse> {
    let peers = ctx
        .registry
        .snapshot()
        .await
        .into_iter()
        .map(|peer| PeerStatus {
            name: peer.name,
            peer_addr: peer.peer_addr,
            connected_at: peer.connected_at.to_rfc3339(),
        })
        .collect();

    Json(StatusResponse {
        started_at: ctx.started_at.to_rfc3339(),
        peers,
        write_queues: ctx.db.queue_depths().await,
        pending_stats: ctx.db.pending_stats().await,
    })
}

pub fn build_router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}
