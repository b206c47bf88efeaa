use crate::backend::{TaskFilter, TaskOrder};
use crate::{Result, StoreError, TaskQueue};
use chrono::{DateTime, Utc};
use flowforge_core::{Task, TaskId, TaskStatus, Transition};
use tracing::debug;

/// Exclusive hold on a `processing` task, owned by one worker for one attempt.
#[derive(Debug, Clone)]
pub struct Claim {
    task: Task,
    worker_id: String,
}

impl Claim {
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Attempt number of this claim, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.task.attempt_count
    }

    pub fn claimed_at(&self) -> Option<DateTime<Utc>> {
        self.task.claimed_at
    }

    /// Whether `row` is still held by this claim.
    pub(crate) fn holds(&self, row: &Task) -> bool {
        row.status == TaskStatus::Processing
            && row.assigned_worker.as_deref() == Some(self.worker_id.as_str())
            && row.attempt_count == self.task.attempt_count
    }
}

impl TaskQueue {
    /// Claim the oldest pending task for `worker_id`.
    ///
    /// Returns `Ok(None)` when nothing is pending or every pending row is
    /// locked by a concurrent claim. Ordering is oldest-first on a best-effort
    /// basis only: a row locked by another claimant is skipped, so a later
    /// task may be handed out before an earlier one.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Claim>> {
        let mut tx = self.backend().begin().await?;
        let mut rows = tx
            .select_for_update_skip_locked(
                &TaskFilter::with_status(TaskStatus::Pending),
                TaskOrder::CreatedAt,
                1,
            )
            .await?;

        let Some(mut task) = rows.pop() else {
            tx.rollback().await?;
            return Ok(None);
        };

        // The row is locked now; make sure nobody claimed it in between.
        if task.status != TaskStatus::Pending {
            tx.rollback().await?;
            return Err(StoreError::Conflict(format!(
                "task {} is {} after locking",
                task.id, task.status
            )));
        }

        let now = tx.now().await?;
        task.apply(Transition::Claim {
            worker_id: worker_id.to_string(),
            at: now,
        })?;
        tx.update(&task).await?;
        tx.commit().await?;

        debug!(
            task_id = %task.id,
            worker_id,
            attempt = task.attempt_count,
            "Task claimed"
        );
        Ok(Some(Claim {
            task,
            worker_id: worker_id.to_string(),
        }))
    }
}
