use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::state::AppState;
use crate::supervisor::run_connection;
use crate::transport::Transport;

/// WebSocket upgrade handler, mounted on `/ws` and `/p2`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    tracing::debug!(peer = %addr, "WebSocket upgrade requested");

    let limit = state.config.inbound_limit();
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| async move {
            run_connection(Transport::from_websocket(socket, Some(addr)), state).await;
        })
}
