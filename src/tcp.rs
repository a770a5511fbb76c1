//! Newline-delimited JSON over raw TCP

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::Instrument;

use crate::state::AppState;
use crate::supervisor::run_connection;
use crate::transport::Transport;

/// Accept loop for the TCP transport. Returns once the server shuts down.
pub async fn serve_tcp(listener: TcpListener, state: Arc<AppState>) {
    let max_line = state.config.inbound_limit();
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("TCP transport listening on {}", addr);
    }

    loop {
        let accepted = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer)) => {
                if let Err(e) = socket.set_nodelay(true) {
                    tracing::debug!(peer = %peer, "Failed to set TCP_NODELAY: {}", e);
                }
                let transport = Transport::from_tcp(socket, Some(peer), max_line);
                tokio::spawn(run_connection(transport, state.clone()).in_current_span());
            }
            Err(e) => {
                // Usually fd exhaustion; back off instead of spinning
                tracing::warn!("TCP accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    tracing::info!("TCP transport stopped");
}
