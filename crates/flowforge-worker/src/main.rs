use clap::Parser;
use flowforge_store::{PgBackend, TaskBackend, TaskQueue};
use flowforge_worker::{SimulatedWorkHandler, Worker, WorkerArgs};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerArgs::parse().into_config()?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.as_str().into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }

    let backend = PgBackend::connect(&config.database).await?;
    backend.migrate().await?;
    let backend = Arc::new(backend);

    let queue = TaskQueue::new(backend.clone(), config.retry_policy());
    let handler = Arc::new(SimulatedWorkHandler::new(Duration::from_millis(
        config.work_duration_ms,
    )));
    let worker = Worker::new(config, queue, handler);

    tokio::spawn(shutdown_signal(worker.shutdown_token()));

    worker.run().await?;
    backend.close().await;

    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
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

    tracing::info!("Received shutdown signal");
    token.cancel();
}
