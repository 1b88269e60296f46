//! Health check endpoints.

use axum::{extract::State, response::IntoResponse, Json};
use chrono::Utc;
use serde_json::json;
use std::sync::atomic::Ordering;

use super::AppState;

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0);
    Json(json!({
        "status": "ok",
        "name": state.name,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime,
        "connected": state.connected.load(Ordering::Relaxed),
        "running_tasks": state.executor.tracker().running_count().await,
    }))
}

/// GET /version
pub async fn version() -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "compression": ["none", "zstd"],
    }))
}
