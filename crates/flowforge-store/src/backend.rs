use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowforge_core::{Task, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Row predicate shared by selection, listing and purging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub id: Option<TaskId>,
    pub status: Option<TaskStatus>,
    /// Matches rows whose `claimed_at` is strictly earlier.
    pub claimed_before: Option<DateTime<Utc>>,
}

impl TaskFilter {
    pub fn all() -> Self {
        TaskFilter::default()
    }

    pub fn by_id(id: TaskId) -> Self {
        TaskFilter {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn with_status(status: TaskStatus) -> Self {
        TaskFilter {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Processing rows claimed before `cutoff`, i.e. with an expired lease.
    pub fn stale_claims(cutoff: DateTime<Utc>) -> Self {
        TaskFilter {
            status: Some(TaskStatus::Processing),
            claimed_before: Some(cutoff),
            ..Default::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if self.id.is_some_and(|id| id != task.id) {
            return false;
        }
        if self.status.is_some_and(|status| status != task.status) {
            return false;
        }
        if let Some(cutoff) = self.claimed_before {
            match task.claimed_at {
                Some(claimed_at) if claimed_at < cutoff => {}
                _ => return false,
            }
        }
        true
    }
}

/// Row ordering. Ties are always broken by `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOrder {
    /// Oldest first, the claim order.
    CreatedAt,
    /// Newest first, for listings.
    CreatedAtDesc,
    /// Longest-held claims first, for the reaper.
    ClaimedAt,
}

impl TaskOrder {
    pub fn compare(&self, a: &Task, b: &Task) -> Ordering {
        match self {
            TaskOrder::CreatedAt => a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)),
            TaskOrder::CreatedAtDesc => b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)),
            TaskOrder::ClaimedAt => a.claimed_at.cmp(&b.claimed_at).then(a.id.cmp(&b.id)),
        }
    }

    pub(crate) fn sql(&self) -> &'static str {
        match self {
            TaskOrder::CreatedAt => "created_at ASC, id ASC",
            TaskOrder::CreatedAtDesc => "created_at DESC, id DESC",
            TaskOrder::ClaimedAt => "claimed_at ASC, id ASC",
        }
    }
}

/// Number of tasks per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn get(&self, status: TaskStatus) -> u64 {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Processing => self.processing,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
        }
    }

    pub fn add(&mut self, status: TaskStatus, n: u64) {
        match status {
            TaskStatus::Pending => self.pending += n,
            TaskStatus::Processing => self.processing += n,
            TaskStatus::Completed => self.completed += n,
            TaskStatus::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// One open store transaction.
///
/// Rows returned by the `select_*` methods stay locked until the transaction
/// commits or rolls back. Dropping an unfinished transaction rolls it back.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Lock and return up to `limit` matching rows, skipping rows locked by
    /// other transactions instead of waiting for them.
    async fn select_for_update_skip_locked(
        &mut self,
        filter: &TaskFilter,
        order: TaskOrder,
        limit: usize,
    ) -> Result<Vec<Task>>;

    /// Lock and return up to `limit` matching rows, waiting for rows that
    /// other transactions hold.
    async fn select_for_update(
        &mut self,
        filter: &TaskFilter,
        order: TaskOrder,
        limit: usize,
    ) -> Result<Vec<Task>>;

    /// Write the mutable fields of `task` back to its row.
    async fn update(&mut self, task: &Task) -> Result<()>;

    /// Current time on the store's clock. Lease stamps and lease cutoffs both
    /// read it, so worker hosts with skewed clocks agree on expiry.
    async fn now(&mut self) -> Result<DateTime<Utc>>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// A transactional task store.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    async fn insert(&self, task: &Task) -> Result<()>;

    async fn get(&self, id: TaskId) -> Result<Option<Task>>;

    /// Matching rows, newest first.
    async fn list(&self, filter: &TaskFilter, limit: usize, offset: usize) -> Result<Vec<Task>>;

    async fn count_by_status(&self) -> Result<StatusCounts>;

    /// Delete matching rows that no transaction currently holds.
    async fn purge(&self, filter: &TaskFilter) -> Result<u64>;

    async fn ping(&self) -> Result<()>;

    async fn close(&self);

    /// Short backend name for logs and health output.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matching() {
        let now = Utc::now();
        let mut task = Task::new(json!(1)).unwrap();

        assert!(TaskFilter::all().matches(&task));
        assert!(TaskFilter::by_id(task.id).matches(&task));
        assert!(!TaskFilter::by_id(TaskId::new_v4()).matches(&task));
        assert!(TaskFilter::with_status(TaskStatus::Pending).matches(&task));
        assert!(!TaskFilter::stale_claims(now).matches(&task));

        task.status = TaskStatus::Processing;
        task.claimed_at = Some(now - chrono::Duration::minutes(10));
        assert!(TaskFilter::stale_claims(now - chrono::Duration::minutes(5)).matches(&task));
        assert!(!TaskFilter::stale_claims(now - chrono::Duration::minutes(15)).matches(&task));
    }

    #[test]
    fn test_order_breaks_ties_by_id() {
        let at = Utc::now();
        let a = Task::builder(json!(1)).created_at(at).build().unwrap();
        let b = Task::builder(json!(2)).created_at(at).build().unwrap();
        let (first, second) = if a.id < b.id { (&a, &b) } else { (&b, &a) };

        assert_eq!(TaskOrder::CreatedAt.compare(first, second), Ordering::Less);
        assert_eq!(TaskOrder::CreatedAtDesc.compare(first, second), Ordering::Greater);
    }

    #[test]
    fn test_status_counts() {
        let mut counts = StatusCounts::default();
        counts.add(TaskStatus::Pending, 3);
        counts.add(TaskStatus::Failed, 1);
        assert_eq!(counts.get(TaskStatus::Pending), 3);
        assert_eq!(counts.total(), 4);
    }
}
