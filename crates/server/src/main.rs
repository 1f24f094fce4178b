mod audit;
mod bootstrap;
mod dispatch;
mod health;
mod queue;
mod routes;
mod services;
#[cfg(test)]
mod test_support;

use std::time::Duration;

use anyhow::{Context, Result};
use tars_core::config::{AppConfig, LoadOptions, LogFormat};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crate::queue::{spawn_checkpoint_pruner, QueueSettings, QueueWorker};

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    match config.logging.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let queue_worker = QueueWorker::new(
        app.services.queue(),
        app.services.clone(),
        QueueSettings::from(&app.config.queue),
    )
    .spawn(shutdown_rx.clone());
    let pruner = spawn_checkpoint_pruner(
        app.checkpoints.clone(),
        Duration::from_secs(app.config.checkpoint.prune_interval_secs),
        shutdown_rx,
    );

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "tars-server listening"
    );

    axum::serve(listener, app.router.clone()).with_graceful_shutdown(wait_for_shutdown()).await?;

    tracing::info!(event_name = "system.server.stopping", correlation_id = "shutdown", "tars-server stopping");
    let _ = shutdown_tx.send(true);
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    if tokio::time::timeout(grace, async {
        let _ = queue_worker.await;
        let _ = pruner.await;
    })
    .await
    .is_err()
    {
        tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            "background workers did not stop within the grace period"
        );
    }
    app.shutdown().await;

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(
            event_name = "system.server.signal_error",
            correlation_id = "shutdown",
            error = %error,
            "failed to listen for shutdown signal"
        );
    }
}
