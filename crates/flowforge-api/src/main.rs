use clap::Parser;
use flowforge_api::background::Background;
use flowforge_api::server::{app, metrics_app, serve};
use flowforge_api::{ApiArgs, ApiMetrics, AppState};
use flowforge_store::{PgBackend, Reaper, TaskBackend, TaskQueue};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ApiArgs::parse().into_config()?;

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
    let metrics = Arc::new(ApiMetrics::new()?);
    let state = AppState::new(queue.clone(), metrics.clone());
    let shutdown = CancellationToken::new();

    // Background housekeeping
    let mut background = Background::new(queue.clone(), metrics.clone(), config.stats_refresh());
    if config.reaper.enabled {
        let reaper = Reaper::new(queue, config.reaper_lease())
            .with_interval(config.reaper_interval())
            .with_batch_size(config.reaper.batch_size);
        background = background.with_reaper(reaper);
    }
    let background = tokio::spawn(background.run(shutdown.clone()));

    // Start metrics server
    let metrics_addr = config.metrics_addr();
    let metrics_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let router = metrics_app(metrics);
        if let Err(e) = serve("Metrics server", &metrics_addr, router, metrics_shutdown).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    tokio::spawn(shutdown_signal(shutdown.clone()));

    // Serve the API until a shutdown signal arrives
    let result = serve("REST API", &config.bind_addr(), app(state), shutdown.clone()).await;
    shutdown.cancel();

    if let Err(e) = background.await {
        tracing::error!("Background loop ended abnormally: {}", e);
    }
    backend.close().await;

    result
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
