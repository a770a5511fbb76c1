pub mod registry;

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::auth::{self, Authorizer};
use crate::broadcast::BroadcastEngine;
use crate::config::RelayConfig;
use crate::types::RelayStats;
use registry::RoomRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub registry: Arc<RoomRegistry>,
    pub broadcaster: Arc<BroadcastEngine>,
    pub authorizer: Arc<dyn Authorizer>,
    /// Parent of every connection's token. Cancelling it closes everything.
    pub shutdown: CancellationToken,
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new());
        Self {
            authorizer: auth::from_config(&config),
            config: Arc::new(config),
            broadcaster: Arc::new(BroadcastEngine::new(registry.clone())),
            registry,
            shutdown: CancellationToken::new(),
            prometheus: None,
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            connections_open: self.registry.connection_count().await,
            rooms_active: self.registry.room_count().await,
            broadcast_failures: self.broadcaster.failure_count(),
        }
    }

    /// Ask every connection to close
    pub fn begin_shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!("Shutdown requested, closing connections");
            self.shutdown.cancel();
        }
    }

    /// Wait until every connection has unregistered. Returns false on timeout.
    pub async fn wait_for_drain(&self, limit: Duration) -> bool {
        let drained = tokio::time::timeout(limit, async {
            while self.registry.connection_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .is_ok();

        if !drained {
            let remaining = self.registry.connection_count().await;
            tracing::warn!(remaining, "Connections still open after drain timeout");
        }
        drained
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}
