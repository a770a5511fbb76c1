use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use roomcast::{config::RelayConfig, server};

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist, only log if it's a different issue
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting roomcast relay...");

    let config = RelayConfig::from_env();
    if let Err(e) = server::run(config).await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}
