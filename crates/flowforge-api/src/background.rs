use crate::metrics::ApiMetrics;
use flowforge_store::{Reaper, TaskQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Periodic housekeeping for the API process: reaper passes and task gauges.
pub struct Background {
    queue: TaskQueue,
    metrics: Arc<ApiMetrics>,
    reaper: Option<Reaper>,
    stats_refresh: Duration,
}

impl Background {
    pub fn new(queue: TaskQueue, metrics: Arc<ApiMetrics>, stats_refresh: Duration) -> Self {
        Background {
            queue,
            metrics,
            reaper: None,
            stats_refresh,
        }
    }

    pub fn with_reaper(mut self, reaper: Reaper) -> Self {
        self.reaper = Some(reaper);
        self
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let reaper_interval = self
            .reaper
            .as_ref()
            .map(Reaper::interval)
            .unwrap_or(self.stats_refresh);
        info!(
            reaper = self.reaper.is_some(),
            stats_refresh_secs = self.stats_refresh.as_secs(),
            "Background loop started"
        );

        let mut stats_ticker = ticker(self.stats_refresh);
        let mut reaper_ticker = ticker(reaper_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = stats_ticker.tick() => self.refresh_stats().await,
                _ = reaper_ticker.tick(), if self.reaper.is_some() => self.reap().await,
            }
        }
        info!("Background loop stopped");
    }

    async fn refresh_stats(&self) {
        match self.queue.counts().await {
            Ok(counts) => {
                debug!(?counts, "Task gauges refreshed");
                self.metrics.update_task_counts(&counts);
            }
            Err(e) => warn!("Failed to refresh task gauges: {}", e),
        }
    }

    async fn reap(&self) {
        let Some(reaper) = &self.reaper else {
            return;
        };
        match reaper.tick().await {
            Ok(report) => self.metrics.record_reap(&report),
            Err(e) if e.is_transient() => warn!("Reaper pass skipped: {}", e),
            Err(e) => error!("Reaper pass failed: {}", e),
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
