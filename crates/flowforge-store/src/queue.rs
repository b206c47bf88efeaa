use crate::backend::{StatusCounts, TaskBackend, TaskFilter, TaskOrder};
use crate::{Claim, Result, StoreError};
use chrono::Utc;
use flowforge_core::{RetryPolicy, Task, TaskExecutionError, TaskId, TaskStatus, Transition};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Queue operations over a [`TaskBackend`].
///
/// Cheap to clone; every clone shares the backend and its connection pool.
#[derive(Clone)]
pub struct TaskQueue {
    backend: Arc<dyn TaskBackend>,
    policy: RetryPolicy,
}

impl TaskQueue {
    pub fn new(backend: Arc<dyn TaskBackend>, policy: RetryPolicy) -> Self {
        TaskQueue { backend, policy }
    }

    pub fn backend(&self) -> &Arc<dyn TaskBackend> {
        &self.backend
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Persist a new `pending` task.
    pub async fn submit(&self, payload: serde_json::Value) -> Result<Task> {
        let task = Task::new(payload)?;
        self.backend.insert(&task).await?;
        info!(task_id = %task.id, "Task submitted");
        Ok(task)
    }

    pub async fn get(&self, id: TaskId) -> Result<Task> {
        self.backend
            .get(id)
            .await?
            .ok_or(StoreError::TaskNotFound(id))
    }

    /// Tasks newest first, optionally restricted to one status.
    pub async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Task>> {
        let filter = TaskFilter {
            status,
            ..Default::default()
        };
        self.backend.list(&filter, limit, offset).await
    }

    pub async fn counts(&self) -> Result<StatusCounts> {
        self.backend.count_by_status().await
    }

    /// Mark the claimed task `completed`.
    pub async fn report_success(&self, claim: &Claim) -> Result<Task> {
        let task = self
            .settle(claim, |_| Transition::Complete { at: Utc::now() })
            .await?;
        info!(
            task_id = %task.id,
            worker_id = claim.worker_id(),
            attempt = claim.attempt(),
            "Task completed"
        );
        Ok(task)
    }

    /// Record a failure; the task is retried or failed according to the policy.
    pub async fn report_failure(&self, claim: &Claim, error: &TaskExecutionError) -> Result<Task> {
        let message = error.message().to_string();
        let policy = &self.policy;
        let task = self
            .settle(claim, |task| policy.on_failure(task, message, Utc::now()))
            .await?;

        if task.status == TaskStatus::Failed {
            warn!(
                task_id = %task.id,
                worker_id = claim.worker_id(),
                attempt = claim.attempt(),
                error = %error,
                "Task failed permanently"
            );
        } else {
            info!(
                task_id = %task.id,
                worker_id = claim.worker_id(),
                attempt = claim.attempt(),
                error = %error,
                "Task requeued for retry"
            );
        }
        Ok(task)
    }

    /// Hand an unreported claim back to `pending`.
    pub async fn release(&self, claim: &Claim) -> Result<Task> {
        let task = self
            .settle(claim, |_| Transition::Release { at: Utc::now() })
            .await?;
        warn!(
            task_id = %task.id,
            worker_id = claim.worker_id(),
            attempt = claim.attempt(),
            "Claim released without a report"
        );
        Ok(task)
    }

    /// Apply the transition chosen by `decide` to the row behind `claim`,
    /// provided the claim is still the one holding it.
    async fn settle<F>(&self, claim: &Claim, decide: F) -> Result<Task>
    where
        F: FnOnce(&Task) -> Transition + Send,
    {
        let mut tx = self.backend.begin().await?;
        let mut rows = tx
            .select_for_update(&TaskFilter::by_id(claim.task_id()), TaskOrder::CreatedAt, 1)
            .await?;
        let Some(mut task) = rows.pop() else {
            tx.rollback().await?;
            return Err(StoreError::TaskNotFound(claim.task_id()));
        };

        if task.status == TaskStatus::Processing && !claim.holds(&task) {
            tx.rollback().await?;
            return Err(StoreError::ClaimLost {
                task_id: task.id,
                worker_id: claim.worker_id().to_string(),
            });
        }

        let transition = decide(&task);
        if let Err(e) = task.apply(transition) {
            tx.rollback().await?;
            return Err(e.into());
        }
        tx.update(&task).await?;
        tx.commit().await?;
        debug!(task_id = %task.id, status = %task.status, "Claim settled");
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBackend;
    use serde_json::json;

    fn queue(max_attempts: u32) -> TaskQueue {
        TaskQueue::new(
            Arc::new(InMemoryBackend::new()),
            RetryPolicy::new(max_attempts),
        )
    }

    #[tokio::test]
    async fn test_submit_and_get() {
        let queue = queue(3);
        let task = queue.submit(json!({"kind": "email"})).await.unwrap();

        let fetched = queue.get(task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Pending);
        assert_eq!(fetched.payload, json!({"kind": "email"}));

        let missing = queue.get(TaskId::new_v4()).await.unwrap_err();
        assert!(matches!(missing, StoreError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_failure_scenario_with_two_workers() {
        let queue = queue(2);
        let t1 = queue.submit(json!("x")).await.unwrap();

        let claim = queue.claim_next("W1").await.unwrap().unwrap();
        assert_eq!(claim.task_id(), t1.id);
        assert_eq!(claim.attempt(), 1);

        let after = queue
            .report_failure(&claim, &TaskExecutionError::new("boom"))
            .await
            .unwrap();
        assert_eq!(after.status, TaskStatus::Pending);
        assert_eq!(after.attempt_count, 1);
        assert!(after.assigned_worker.is_none());
        assert!(after.claimed_at.is_none());

        let claim = queue.claim_next("W2").await.unwrap().unwrap();
        assert_eq!(claim.task_id(), t1.id);
        assert_eq!(claim.attempt(), 2);

        queue
            .report_failure(&claim, &TaskExecutionError::new("boom"))
            .await
            .unwrap();
        let stored = queue.get(t1.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.attempt_count, 2);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_exhausting_attempts_ends_failed() {
        let max_attempts = 4;
        let queue = queue(max_attempts);
        let task = queue.submit(json!(null)).await.unwrap();

        for i in 0..max_attempts {
            let claim = queue.claim_next(&format!("w{}", i)).await.unwrap().unwrap();
            queue
                .report_failure(&claim, &TaskExecutionError::new(format!("err {}", i)))
                .await
                .unwrap();
        }

        let stored = queue.get(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.attempt_count, max_attempts);
        assert!(queue.claim_next("late").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_success_report_is_rejected() {
        let queue = queue(3);
        queue.submit(json!("once")).await.unwrap();
        let claim = queue.claim_next("w1").await.unwrap().unwrap();

        let done = queue.report_success(&claim).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);

        let again = queue.report_success(&claim).await.unwrap_err();
        assert!(again.is_invalid_transition());

        let stored = queue.get(claim.task_id()).await.unwrap();
        assert_eq!(stored, done);
    }

    #[tokio::test]
    async fn test_stale_claim_cannot_report() {
        let queue = queue(3);
        let task = queue.submit(json!("slow")).await.unwrap();
        let stale = queue.claim_next("w1").await.unwrap().unwrap();

        queue.release(&stale).await.unwrap();
        let fresh = queue.claim_next("w2").await.unwrap().unwrap();
        assert_eq!(fresh.task_id(), task.id);

        let err = queue.report_success(&stale).await.unwrap_err();
        assert!(matches!(err, StoreError::ClaimLost { ref worker_id, .. } if worker_id == "w1"));

        let stored = queue.get(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Processing);
        assert_eq!(stored.assigned_worker.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_release_keeps_attempt_count() {
        let queue = queue(3);
        queue.submit(json!(1)).await.unwrap();
        let claim = queue.claim_next("w1").await.unwrap().unwrap();

        let released = queue.release(&claim).await.unwrap();
        assert_eq!(released.status, TaskStatus::Pending);
        assert_eq!(released.attempt_count, 1);
        assert_eq!(released.timeout_count, 0);
        assert!(released.last_error.is_none());
    }

    #[tokio::test]
    async fn test_list_and_counts() {
        let queue = queue(3);
        for i in 0..3 {
            queue.submit(json!(i)).await.unwrap();
        }
        let claim = queue.claim_next("w1").await.unwrap().unwrap();
        queue.report_success(&claim).await.unwrap();

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.completed, 1);

        let pending = queue.list(Some(TaskStatus::Pending), 10, 0).await.unwrap();
        assert_eq!(pending.len(), 2);
        let all = queue.list(None, 10, 0).await.unwrap();
        assert_eq!(all.len(), 3);
    }
}
