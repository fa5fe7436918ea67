use std::sync::Arc;

use anyhow::Context;
use ferry::config::EngineConfig;
use ferry::database;
use ferry::engine::Engine;
use ferry::logging::init_logging;
use tracing::info;
use transfer_executor::RcloneExecutor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env().context("Failed to load configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit.
    let (logging, _log_guard) = init_logging(&config.logging)?;

    let pool = database::init_pool_with_size(&config.database.url, config.database.max_connections)
        .await
        .with_context(|| format!("Failed to open database {}", config.database.url))?;
    database::run_migrations(&pool).await?;

    let executor = RcloneExecutor::with_rclone_path(&config.executor.rclone_path)
        .with_config_path(config.executor.rclone_config.clone())
        .with_extra_args(config.executor.extra_args.clone());

    let engine = Engine::new(config, pool.clone(), Arc::new(executor));
    logging.start_retention_cleanup(engine.cancellation_token());
    engine.start().await?;
    info!("ferry started");

    shutdown_signal().await;
    info!("Shutdown signal received");

    engine.shutdown().await;
    pool.close().await;
    info!("ferry stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
