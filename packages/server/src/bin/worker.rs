// Standalone queue worker.
//
// Loads a WorkerConfig (file path from the first argument or
// PRISMQ_WORKER_CONFIG, else pure environment), registers the built-in
// smoke-test handlers, and polls until ctrl-c. Real deployments embed
// WorkerEngine and register their own handlers at startup.

use std::sync::Arc;

use anyhow::{Context, Result};
use prismq::{HandlerRegistry, QueueStore, WorkerConfig, WorkerEngine};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Handlers useful for soak-testing a deployment: `noop` completes
/// immediately, `sleep` waits for `payload.seconds` (honoring cancellation).
fn register_builtin_handlers(registry: &HandlerRegistry) -> Result<()> {
    registry.register(
        "noop",
        |_task, _cancel| async { Ok(()) },
        "completes immediately",
        "1.0",
        false,
    )?;

    registry.register(
        "sleep",
        |task, cancel| async move {
            let seconds = task.payload()?["seconds"].as_f64().unwrap_or(1.0);
            tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("cancelled"),
                _ = tokio::time::sleep(std::time::Duration::from_secs_f64(seconds)) => Ok(()),
            }
        },
        "sleeps for payload.seconds",
        "1.0",
        false,
    )?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,prismq=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let _ = dotenvy::dotenv();

    // Config file path: first CLI argument, then PRISMQ_WORKER_CONFIG, then
    // pure environment (PRISMQ_WORKER_* variables).
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PRISMQ_WORKER_CONFIG").ok());
    let worker_config = match &config_path {
        Some(path) => WorkerConfig::load(path)
            .with_context(|| format!("Failed to load worker config from {path}"))?,
        None => WorkerConfig::from_env().context(
            "No config file given and PRISMQ_WORKER_* environment is incomplete",
        )?,
    };

    let db_path =
        std::env::var("PRISMQ_QUEUE_DB_PATH").unwrap_or_else(|_| "prismq_queue.db".to_string());
    let store = QueueStore::open(&db_path)
        .await
        .context("Failed to open queue store")?;

    let registry = Arc::new(HandlerRegistry::new());
    register_builtin_handlers(&registry)?;

    tracing::info!(
        worker_id = %worker_config.worker_id,
        strategy = %worker_config.scheduling_strategy,
        handlers = ?registry.registered_types(),
        "worker starting"
    );

    let engine = WorkerEngine::from_worker_config(store, registry, &worker_config);
    engine
        .run_until_shutdown()
        .await
        .context("Worker engine error")?;

    Ok(())
}
