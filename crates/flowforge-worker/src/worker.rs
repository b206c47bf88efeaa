use crate::backoff::Backoff;
use crate::config::WorkerConfig;
use crate::executor::{Outcome, TaskExecutor};
use crate::handler::TaskHandler;
use flowforge_store::{Reaper, TaskQueue};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters across all poll loops of one worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub unreported: u64,
}

impl WorkerStats {
    pub fn processed(&self) -> u64 {
        self.completed + self.retried + self.failed + self.unreported
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Completed => self.completed += 1,
            Outcome::Retrying => self.retried += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Unreported => self.unreported += 1,
        }
    }
}

/// Worker process: `concurrency` independent poll loops over one queue
pub struct Worker {
    config: WorkerConfig,
    worker_id: String,
    queue: TaskQueue,
    executor: Arc<TaskExecutor>,
    stats: Arc<Mutex<WorkerStats>>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(config: WorkerConfig, queue: TaskQueue, handler: Arc<dyn TaskHandler>) -> Self {
        let worker_id = config.generate_worker_id();
        let executor = TaskExecutor::new(queue.clone(), handler)
            .with_task_timeout(config.task_timeout());

        Worker {
            config,
            worker_id,
            queue,
            executor: Arc::new(executor),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn stats(&self) -> WorkerStats {
        *self.stats.lock()
    }

    /// Token that stops the worker when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Trigger shutdown
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run until shutdown, then let in-flight tasks finish within the
    /// configured grace period.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!(
            worker_id = %self.worker_id,
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval_ms,
            max_attempts = self.config.max_attempts,
            "Starting worker"
        );

        let mut loops = JoinSet::new();
        let backoff = Backoff::new(
            Duration::from_millis(self.config.backoff_base_ms),
            Duration::from_millis(self.config.backoff_max_ms),
        );

        for slot in 0..self.config.concurrency {
            let poller = PollLoop {
                id: self.loop_id(slot),
                queue: self.queue.clone(),
                executor: self.executor.clone(),
                stats: self.stats.clone(),
                poll_interval: self.config.poll_interval(),
                backoff,
                shutdown: self.shutdown.clone(),
            };
            loops.spawn(poller.run());
        }

        if self.config.run_reaper {
            let reaper = Reaper::new(self.queue.clone(), self.config.lease_duration())
                .with_interval(Duration::from_secs(self.config.reaper_interval_secs));
            let token = self.shutdown.clone();
            loops.spawn(async move { reaper.run(token).await });
        }

        self.shutdown.cancelled().await;
        info!("Worker shutting down gracefully, waiting for in-flight tasks");

        let grace = Duration::from_secs(self.config.graceful_shutdown_timeout_secs);
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = loops.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("Poll loop panicked: {}", e);
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = loops.len(),
                "Shutdown deadline exceeded, abandoning in-flight tasks"
            );
            loops.shutdown().await;
        }

        let stats = self.stats();
        info!(
            processed = stats.processed(),
            completed = stats.completed,
            retried = stats.retried,
            failed = stats.failed,
            "Worker stopped"
        );
        Ok(())
    }

    fn loop_id(&self, slot: usize) -> String {
        if self.config.concurrency == 1 {
            self.worker_id.clone()
        } else {
            format!("{}-{}", self.worker_id, slot)
        }
    }
}

struct PollLoop {
    id: String,
    queue: TaskQueue,
    executor: Arc<TaskExecutor>,
    stats: Arc<Mutex<WorkerStats>>,
    poll_interval: Duration,
    backoff: Backoff,
    shutdown: CancellationToken,
}

impl PollLoop {
    async fn run(self) {
        debug!(worker_id = %self.id, "Poll loop started");
        let mut failures = 0u32;

        while !self.shutdown.is_cancelled() {
            match self.queue.claim_next(&self.id).await {
                Ok(Some(claim)) => {
                    failures = 0;
                    // Not raced against shutdown: an in-flight task always gets its report.
                    let outcome = self.executor.process(claim).await;
                    self.stats.lock().record(outcome);
                }
                Ok(None) => {
                    failures = 0;
                    if self.sleep(self.poll_interval).await {
                        break;
                    }
                }
                Err(e) if e.is_conflict() => {
                    debug!(worker_id = %self.id, "Claim conflict, retrying: {}", e);
                    tokio::task::yield_now().await;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.backoff.delay(failures);
                    if e.is_transient() {
                        warn!(
                            worker_id = %self.id,
                            retry_in_ms = delay.as_millis() as u64,
                            "Store unavailable: {}",
                            e
                        );
                    } else {
                        error!(
                            worker_id = %self.id,
                            retry_in_ms = delay.as_millis() as u64,
                            "Claim failed: {}",
                            e
                        );
                    }
                    if self.sleep(delay).await {
                        break;
                    }
                }
            }
        }
        debug!(worker_id = %self.id, "Poll loop stopped");
    }

    /// Sleep, returning true if shutdown was requested meanwhile.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}
