//! Metric names, the Prometheus recorder, and the periodic stats reporter.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;

use crate::error::StartupError;
use crate::state::AppState;

/// Open connections (gauge)
pub const CONNECTIONS_OPEN: &str = "relay_connections_open";
/// Rooms with at least one member (gauge)
pub const ROOMS_ACTIVE: &str = "relay_rooms_active";
/// Per-target broadcast deliveries that failed (counter, labels: reason)
pub const BROADCAST_FAILURES_TOTAL: &str = "relay_broadcast_failures_total";
/// Connections accepted (counter, labels: transport)
pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
/// Connections closed (counter, labels: reason)
pub const DISCONNECTIONS_TOTAL: &str = "relay_disconnections_total";
/// Inbound frames handed to the dispatcher (counter)
pub const FRAMES_IN_TOTAL: &str = "relay_frames_in_total";
/// Malformed or rejected frames (counter, labels: code)
pub const PROTOCOL_ERRORS_TOTAL: &str = "relay_protocol_errors_total";
/// Broadcasts fanned out (counter)
pub const BROADCASTS_TOTAL: &str = "relay_broadcasts_total";

/// Install the global Prometheus recorder. Call once at startup.
pub fn install_recorder() -> Result<PrometheusHandle, StartupError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| StartupError::Metrics(e.to_string()))?;
    tracing::info!("Prometheus metrics recorder installed");
    Ok(handle)
}

/// Spawn a background task that republishes the relay gauges and logs a
/// stats line until shutdown
pub fn spawn_stats_reporter(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.stats_interval.max(std::time::Duration::from_millis(1)));
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let stats = state.stats().await;
            metrics::gauge!(CONNECTIONS_OPEN).set(stats.connections_open as f64);
            metrics::gauge!(ROOMS_ACTIVE).set(stats.rooms_active as f64);

            tracing::debug!(
                connections_open = stats.connections_open,
                rooms_active = stats.rooms_active,
                broadcast_failures = stats.broadcast_failures,
                "Relay stats"
            );
        }
    });
}
