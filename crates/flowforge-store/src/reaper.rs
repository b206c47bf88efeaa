use crate::backend::{StoreTransaction, TaskFilter, TaskOrder};
use crate::{Result, TaskQueue};
use chrono::{DateTime, Utc};
use flowforge_core::Transition;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one reaper pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Expired claims returned to `pending`
    pub requeued: usize,
    /// Expired claims that used up their timeout budget
    pub failed: usize,
}

impl ReapReport {
    pub fn total(&self) -> usize {
        self.requeued + self.failed
    }

    fn merge(&mut self, other: ReapReport) {
        self.requeued += other.requeued;
        self.failed += other.failed;
    }
}

impl TaskQueue {
    /// Recover up to `batch_size` claims older than `lease`, measured on the
    /// store's clock.
    pub async fn reap_expired(&self, lease: Duration, batch_size: usize) -> Result<ReapReport> {
        let mut tx = self.backend().begin().await?;
        let now = tx.now().await?;
        self.reap_in(tx, now, lease, batch_size).await
    }

    /// Recover up to `batch_size` claims older than `lease` as of `now`.
    ///
    /// Rows are selected with skip-locked semantics so several reapers can run
    /// side by side without blocking each other or claimers.
    pub async fn reap_expired_at(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        batch_size: usize,
    ) -> Result<ReapReport> {
        let tx = self.backend().begin().await?;
        self.reap_in(tx, now, lease, batch_size).await
    }

    async fn reap_in(
        &self,
        mut tx: Box<dyn StoreTransaction>,
        now: DateTime<Utc>,
        lease: Duration,
        batch_size: usize,
    ) -> Result<ReapReport> {
        let Some(cutoff) = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease))
        else {
            tx.rollback().await?;
            return Ok(ReapReport::default());
        };

        let rows = tx
            .select_for_update_skip_locked(
                &TaskFilter::stale_claims(cutoff),
                TaskOrder::ClaimedAt,
                batch_size,
            )
            .await?;

        let mut report = ReapReport::default();
        for mut task in rows {
            let worker = task.assigned_worker.clone().unwrap_or_default();
            let transition = self.policy().on_lease_expired(&task, now);
            let failing = matches!(transition, Transition::ExpireFail { .. });
            task.apply(transition)?;
            tx.update(&task).await?;

            if failing {
                report.failed += 1;
                warn!(
                    task_id = %task.id,
                    worker_id = %worker,
                    attempt = task.attempt_count,
                    timeouts = task.timeout_count,
                    "Lease expired, task failed"
                );
            } else {
                report.requeued += 1;
                warn!(
                    task_id = %task.id,
                    worker_id = %worker,
                    attempt = task.attempt_count,
                    timeouts = task.timeout_count,
                    "Lease expired, task requeued"
                );
            }
        }
        tx.commit().await?;
        Ok(report)
    }
}

/// Periodically returns stale claims to the queue.
#[derive(Clone)]
pub struct Reaper {
    queue: TaskQueue,
    lease: Duration,
    interval: Duration,
    batch_size: usize,
}

impl Reaper {
    pub fn new(queue: TaskQueue, lease: Duration) -> Self {
        Reaper {
            queue,
            lease,
            interval: Duration::from_secs(30),
            batch_size: 100,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Reap in batches until a batch comes back short.
    pub async fn tick(&self) -> Result<ReapReport> {
        let mut report = ReapReport::default();
        loop {
            let batch = self
                .queue
                .reap_expired(self.lease, self.batch_size)
                .await?;
            report.merge(batch);
            if batch.total() < self.batch_size {
                break;
            }
        }
        if report.total() > 0 {
            info!(
                requeued = report.requeued,
                failed = report.failed,
                "Reaper recovered expired claims"
            );
        } else {
            debug!("Reaper found no expired claims");
        }
        Ok(report)
    }

    /// Tick every interval until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            lease_secs = self.lease.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Reaper started"
        );
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        if e.is_transient() {
                            warn!("Reaper pass skipped: {}", e);
                        } else {
                            error!("Reaper pass failed: {}", e);
                        }
                    }
                }
            }
        }
        info!("Reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryBackend, TaskBackend};
    use flowforge_core::{RetryPolicy, TaskExecutionError, TaskStatus, TimeoutAccounting};
    use serde_json::json;
    use std::sync::Arc;

    fn queue(policy: RetryPolicy) -> TaskQueue {
        TaskQueue::new(Arc::new(InMemoryBackend::new()), policy)
    }

    const LEASE: Duration = Duration::from_secs(60);

    fn after_lease() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(61)
    }

    #[tokio::test]
    async fn test_expired_claim_returns_to_pending() {
        let queue = queue(RetryPolicy::new(3));
        let task = queue.submit(json!("x")).await.unwrap();
        queue.claim_next("crashed").await.unwrap().unwrap();

        let report = queue.reap_expired_at(after_lease(), LEASE, 10).await.unwrap();
        assert_eq!(report, ReapReport { requeued: 1, failed: 0 });

        let stored = queue.get(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert!(stored.assigned_worker.is_none());
        assert!(stored.claimed_at.is_none());
        assert_eq!(stored.timeout_count, 1);
        assert_eq!(stored.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_fresh_claims_are_left_alone() {
        let queue = queue(RetryPolicy::new(3));
        let task = queue.submit(json!("x")).await.unwrap();
        queue.claim_next("busy").await.unwrap().unwrap();

        let report = queue.reap_expired_at(Utc::now(), LEASE, 10).await.unwrap();
        assert_eq!(report.total(), 0);
        assert_eq!(queue.get(task.id).await.unwrap().status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn test_separate_accounting_keeps_failure_budget() {
        let queue = queue(RetryPolicy::new(2));
        let task = queue.submit(json!("slow")).await.unwrap();

        for _ in 0..3 {
            queue.claim_next("hung").await.unwrap().unwrap();
            queue.reap_expired_at(after_lease(), LEASE, 10).await.unwrap();
        }

        let claim = queue.claim_next("w").await.unwrap().unwrap();
        let after = queue
            .report_failure(&claim, &TaskExecutionError::new("boom"))
            .await
            .unwrap();
        assert_eq!(after.status, TaskStatus::Pending);
        assert_eq!(after.timeout_count, 3);
        assert_eq!(queue.get(task.id).await.unwrap().attempt_count, 4);
    }

    #[tokio::test]
    async fn test_shared_accounting_fails_on_final_attempt() {
        let policy = RetryPolicy::new(2).with_timeout_accounting(TimeoutAccounting::Shared);
        let queue = queue(policy);
        let task = queue.submit(json!("slow")).await.unwrap();

        queue.claim_next("a").await.unwrap().unwrap();
        let first = queue.reap_expired_at(after_lease(), LEASE, 10).await.unwrap();
        assert_eq!(first.requeued, 1);

        queue.claim_next("b").await.unwrap().unwrap();
        let second = queue.reap_expired_at(after_lease(), LEASE, 10).await.unwrap();
        assert_eq!(second.failed, 1);

        let stored = queue.get(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.timeout_count, 2);
        assert_eq!(stored.attempt_count, 2);
        assert!(stored.assigned_worker.is_none());
        assert!(stored.last_error.unwrap().contains("lease expired"));
    }

    #[tokio::test]
    async fn test_timeout_ceiling_counts_the_final_expiry() {
        let queue = queue(RetryPolicy::new(3).with_max_timeouts(Some(1)));
        let task = queue.submit(json!("slow")).await.unwrap();
        queue.claim_next("hung").await.unwrap().unwrap();

        let report = queue.reap_expired_at(after_lease(), LEASE, 10).await.unwrap();
        assert_eq!(report, ReapReport { requeued: 0, failed: 1 });

        let stored = queue.get(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.timeout_count, 1);
        assert!(stored.claimed_at.is_none());
        assert_eq!(stored.last_error.as_deref(), Some("lease expired 1 times"));
    }

    #[tokio::test]
    async fn test_lease_measured_on_store_clock() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.set_clock_offset(chrono::Duration::minutes(5));
        let queue = TaskQueue::new(backend.clone(), RetryPolicy::new(3));
        let task = queue.submit(json!("x")).await.unwrap();

        let claim = queue.claim_next("w1").await.unwrap().unwrap();
        let stamped = claim.claimed_at().unwrap();
        assert!(stamped > Utc::now() + chrono::Duration::minutes(4));

        let reaper = Reaper::new(queue.clone(), LEASE);
        assert_eq!(reaper.tick().await.unwrap().total(), 0);
        assert_eq!(queue.get(task.id).await.unwrap().status, TaskStatus::Processing);

        backend.set_clock_offset(chrono::Duration::minutes(7));
        assert_eq!(reaper.tick().await.unwrap().requeued, 1);
        assert_eq!(queue.get(task.id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_reaped_claim_cannot_report() {
        let queue = queue(RetryPolicy::new(3));
        queue.submit(json!("x")).await.unwrap();
        let claim = queue.claim_next("w1").await.unwrap().unwrap();
        queue.reap_expired_at(after_lease(), LEASE, 10).await.unwrap();

        let err = queue.report_success(&claim).await.unwrap_err();
        assert!(err.is_invalid_transition());
    }

    #[tokio::test]
    async fn test_tick_drains_in_batches() {
        let queue = queue(RetryPolicy::new(3));
        let backend = queue.backend().clone();
        let old = Utc::now() - chrono::Duration::minutes(10);
        for i in 0..7 {
            let mut task = flowforge_core::Task::new(json!(i)).unwrap();
            task.apply(Transition::Claim {
                worker_id: "gone".into(),
                at: old,
            })
            .unwrap();
            backend.insert(&task).await.unwrap();
        }

        let reaper = Reaper::new(queue.clone(), LEASE).with_batch_size(3);
        let report = reaper.tick().await.unwrap();
        assert_eq!(report.requeued, 7);
        assert_eq!(queue.counts().await.unwrap().pending, 7);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let queue = queue(RetryPolicy::new(3));
        let reaper = Reaper::new(queue, LEASE).with_interval(Duration::from_millis(10));
        let token = CancellationToken::new();

        let handle = tokio::spawn({
            let token = token.clone();
            async move { reaper.run(token).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
