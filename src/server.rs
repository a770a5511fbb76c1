use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::RelayConfig;
use crate::error::StartupError;
use crate::state::AppState;
use crate::{api, tcp, telemetry, ws};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/p2", get(ws::ws_handler))
        .route("/health", get(api::health))
        .route("/api/stats", get(api::stats))
        .route("/metrics", get(api::metrics))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind every listener, serve until SIGINT/SIGTERM, then drain connections
pub async fn run(config: RelayConfig) -> Result<(), StartupError> {
    let http = bind(config.http_addr).await?;
    let line_listener = match config.tcp_addr {
        Some(addr) => Some(bind(addr).await?),
        None => None,
    };

    let prometheus = telemetry::install_recorder()?;
    let state = Arc::new(AppState::new(config).with_prometheus(prometheus));
    serve(http, line_listener, state, shutdown_signal()).await
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, StartupError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind { addr, source })
}

/// Serve on already-bound listeners until `signal` resolves or the state's
/// shutdown token is cancelled, then wait for connections to drain.
pub async fn serve<F>(
    http: TcpListener,
    line_listener: Option<TcpListener>,
    state: Arc<AppState>,
    signal: F,
) -> Result<(), StartupError>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let config = state.config.clone();
    tracing::info!("Listening on http://{}", http.local_addr()?);

    let tcp_task = line_listener.map(|listener| tokio::spawn(tcp::serve_tcp(listener, state.clone())));

    telemetry::spawn_stats_reporter(state.clone());

    let shutdown_state = state.clone();
    let graceful = async move {
        tokio::select! {
            _ = signal => shutdown_state.begin_shutdown(),
            _ = shutdown_state.shutdown.cancelled() => {}
        }
    };

    axum::serve(
        http,
        router(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(graceful)
    .await?;

    if let Some(task) = tcp_task {
        let _ = task.await;
    }

    let limit = config.drain_timeout + config.write_timeout;
    if state.wait_for_drain(limit).await {
        tracing::info!("All connections drained");
    }
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received ctrl-c"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
