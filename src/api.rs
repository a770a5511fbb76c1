//! HTTP endpoints alongside the WebSocket routes.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::state::registry::RoomSummary;
use crate::state::AppState;
use crate::types::RelayStats;

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: RelayStats,
    pub rooms: Vec<RoomSummary>,
}

/// Liveness probe.
///
/// GET /health
pub async fn health() -> &'static str {
    "ok"
}

/// Relay counters and per-room member counts.
///
/// GET /api/stats
pub async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        stats: state.stats().await,
        rooms: state.registry.room_summaries().await,
    })
}

/// Prometheus text exposition.
///
/// GET /metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
