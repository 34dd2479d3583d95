// Main entry point for the queue API server

use anyhow::{Context, Result};
use prismq::QueueStore;
use server_core::{server::build_app, server::AppState, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,prismq=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting PrismQ API server");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Open the queue store (runs migrations)
    tracing::info!(path = %config.db_path.display(), "Opening queue store...");
    let store = QueueStore::open(&config.db_path)
        .await
        .context("Failed to open queue store")?;

    // Build application
    let state = AppState::new(store, config.backups_dir.clone(), config.temp_dir.clone());
    let app = build_app(state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("Server error")?;

    Ok(())
}
