//! Admin API: read-only view of the registry

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use burrow_control::TunnelRegistry;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct TunnelInfo {
    pub tunnel_id: String,
    pub peer_addr: Option<String>,
    pub uptime_secs: u64,
    pub pending_requests: usize,
}

#[derive(Debug, Serialize)]
pub struct TunnelList {
    pub tunnels: Vec<TunnelInfo>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub active_tunnels: usize,
}

pub fn admin_router(registry: Arc<TunnelRegistry>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tunnels", get(list_tunnels))
        .with_state(registry)
}

async fn health(State(registry): State<Arc<TunnelRegistry>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        active_tunnels: registry.count(),
    })
}

async fn list_tunnels(State(registry): State<Arc<TunnelRegistry>>) -> Json<TunnelList> {
    let tunnels: Vec<TunnelInfo> = registry
        .list_active()
        .into_iter()
        .filter_map(|tunnel_id| {
            let session = registry.lookup(&tunnel_id)?;
            Some(TunnelInfo {
                peer_addr: session.peer_addr().map(|addr| addr.to_string()),
                uptime_secs: session.uptime().as_secs(),
                pending_requests: session.pending_count(),
                tunnel_id,
            })
        })
        .collect();

    Json(TunnelList {
        total: tunnels.len(),
        tunnels,
    })
}
