//! /status, /peers, /limits, /daemon/shutdown handlers.

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use meridian_core::config::LimitsConfig;
use meridian_services::{LimitsUpdate, NetworkStats, PeerSnapshot};

use super::{engine_error, ApiState};

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub addr: SocketAddr,
    pub cache: CacheInfo,
    #[serde(flatten)]
    pub stats: NetworkStats,
}

#[derive(Serialize)]
pub struct CacheInfo {
    pub chunks: usize,
    pub bytes: u64,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let engine = &state.engine;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        addr: engine.local_contact().addr,
        cache: CacheInfo {
            chunks: engine.cache().count(),
            bytes: engine.cache().size(),
        },
        stats: engine.stats(),
    })
}

// ── /peers ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct PeersResponse {
    pub peers: Vec<PeerSnapshot>,
}

pub async fn handle_peers(State(state): State<ApiState>) -> Json<PeersResponse> {
    Json(PeersResponse {
        peers: state.engine.peers(),
    })
}

// ── /limits ───────────────────────────────────────────────────────────────────

pub async fn handle_limits(State(state): State<ApiState>) -> Json<LimitsConfig> {
    Json(state.engine.limits())
}

pub async fn handle_limits_update(
    State(state): State<ApiState>,
    Json(update): Json<LimitsUpdate>,
) -> Result<Json<LimitsConfig>, (StatusCode, String)> {
    state
        .engine
        .update_limits(&update)
        .map(Json)
        .map_err(engine_error)
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());

    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}
