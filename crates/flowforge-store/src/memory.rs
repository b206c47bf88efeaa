//! In-process backend with row-lock emulation.
//!
//! Each transaction owns the rows it selected for update until it finishes.
//! Skip-locked selects pass over rows owned by other transactions; plain
//! `select_for_update` parks on [`Notify`] until they are released. Writes are
//! buffered per transaction and become visible on commit.

use crate::backend::{StatusCounts, StoreTransaction, TaskBackend, TaskFilter, TaskOrder};
use crate::{Result, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowforge_core::{Task, TaskId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct MemoryState {
    rows: HashMap<TaskId, Task>,
    /// Row id to owning transaction id.
    locks: HashMap<TaskId, u64>,
}

struct Shared {
    state: Mutex<MemoryState>,
    released: Notify,
    next_tx: AtomicU64,
    available: AtomicBool,
    clock_offset: Mutex<chrono::Duration>,
}

impl Shared {
    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store is offline".to_string()))
        }
    }
}

/// Volatile backend for tests and single-process runs.
#[derive(Clone)]
pub struct InMemoryBackend {
    shared: Arc<Shared>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        InMemoryBackend {
            shared: Arc::new(Shared {
                state: Mutex::new(MemoryState::default()),
                released: Notify::new(),
                next_tx: AtomicU64::new(1),
                available: AtomicBool::new(true),
                clock_offset: Mutex::new(chrono::Duration::zero()),
            }),
        }
    }

    /// Simulate an outage: while offline every operation fails with
    /// `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Shift the store clock relative to the local one.
    pub fn set_clock_offset(&self, offset: chrono::Duration) {
        *self.shared.clock_offset.lock() = offset;
    }

    /// Number of rows currently locked by open transactions.
    pub fn locked_rows(&self) -> usize {
        self.shared.state.lock().locks.len()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskBackend for InMemoryBackend {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        self.shared.check_available()?;
        let tx_id = self.shared.next_tx.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryTransaction {
            shared: self.shared.clone(),
            tx_id,
            locked: HashSet::new(),
            writes: HashMap::new(),
            finished: false,
        }))
    }

    async fn insert(&self, task: &Task) -> Result<()> {
        self.shared.check_available()?;
        let mut state = self.shared.state.lock();
        if state.rows.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists(task.id));
        }
        state.rows.insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>> {
        self.shared.check_available()?;
        Ok(self.shared.state.lock().rows.get(&id).cloned())
    }

    async fn list(&self, filter: &TaskFilter, limit: usize, offset: usize) -> Result<Vec<Task>> {
        self.shared.check_available()?;
        let state = self.shared.state.lock();
        let mut tasks: Vec<Task> = state
            .rows
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| TaskOrder::CreatedAtDesc.compare(a, b));
        Ok(tasks.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_by_status(&self) -> Result<StatusCounts> {
        self.shared.check_available()?;
        let state = self.shared.state.lock();
        let mut counts = StatusCounts::default();
        for task in state.rows.values() {
            counts.add(task.status, 1);
        }
        Ok(counts)
    }

    async fn purge(&self, filter: &TaskFilter) -> Result<u64> {
        self.shared.check_available()?;
        let mut state = self.shared.state.lock();
        let MemoryState { rows, locks } = &mut *state;
        let before = rows.len();
        rows.retain(|id, task| locks.contains_key(id) || !filter.matches(task));
        Ok((before - rows.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        self.shared.check_available()
    }

    async fn close(&self) {}

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryTransaction {
    shared: Arc<Shared>,
    tx_id: u64,
    locked: HashSet<TaskId>,
    writes: HashMap<TaskId, Task>,
    finished: bool,
}

impl MemoryTransaction {
    /// Matching rows as this transaction sees them, in order.
    fn candidates(&self, state: &MemoryState, filter: &TaskFilter, order: TaskOrder) -> Vec<Task> {
        let mut tasks: Vec<Task> = state
            .rows
            .values()
            .map(|row| self.writes.get(&row.id).unwrap_or(row))
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| order.compare(a, b));
        tasks
    }

    fn held_by_other(&self, state: &MemoryState, id: &TaskId) -> bool {
        state.locks.get(id).is_some_and(|owner| *owner != self.tx_id)
    }

    fn lock_rows(&mut self, state: &mut MemoryState, tasks: &[Task]) {
        for task in tasks {
            state.locks.insert(task.id, self.tx_id);
            self.locked.insert(task.id);
        }
    }

    fn release(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        {
            let mut state = self.shared.state.lock();
            for id in self.locked.drain() {
                if state.locks.get(&id) == Some(&self.tx_id) {
                    state.locks.remove(&id);
                }
            }
        }
        self.shared.released.notify_waiters();
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn select_for_update_skip_locked(
        &mut self,
        filter: &TaskFilter,
        order: TaskOrder,
        limit: usize,
    ) -> Result<Vec<Task>> {
        self.shared.check_available()?;
        let shared = self.shared.clone();
        let mut state = shared.state.lock();
        let selected: Vec<Task> = self
            .candidates(&state, filter, order)
            .into_iter()
            .filter(|task| !self.held_by_other(&state, &task.id))
            .take(limit)
            .collect();
        self.lock_rows(&mut state, &selected);
        debug!(tx = self.tx_id, rows = selected.len(), "skip-locked select");
        Ok(selected)
    }

    async fn select_for_update(
        &mut self,
        filter: &TaskFilter,
        order: TaskOrder,
        limit: usize,
    ) -> Result<Vec<Task>> {
        let shared = self.shared.clone();
        loop {
            shared.check_available()?;
            let notified = shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = shared.state.lock();
                let selected: Vec<Task> = self
                    .candidates(&state, filter, order)
                    .into_iter()
                    .take(limit)
                    .collect();
                if !selected.iter().any(|task| self.held_by_other(&state, &task.id)) {
                    self.lock_rows(&mut state, &selected);
                    return Ok(selected);
                }
            }

            debug!(tx = self.tx_id, "waiting for row lock");
            notified.await;
        }
    }

    async fn update(&mut self, task: &Task) -> Result<()> {
        self.shared.check_available()?;
        let shared = self.shared.clone();
        let mut state = shared.state.lock();
        if !state.rows.contains_key(&task.id) {
            return Err(StoreError::TaskNotFound(task.id));
        }
        if self.held_by_other(&state, &task.id) {
            return Err(StoreError::Conflict(format!(
                "row {} is locked by another transaction",
                task.id
            )));
        }
        self.lock_rows(&mut state, std::slice::from_ref(task));
        self.writes.insert(task.id, task.clone());
        Ok(())
    }

    async fn now(&mut self) -> Result<DateTime<Utc>> {
        self.shared.check_available()?;
        Ok(Utc::now() + *self.shared.clock_offset.lock())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        if let Err(e) = self.shared.check_available() {
            self.release();
            return Err(e);
        }
        {
            let mut state = self.shared.state.lock();
            for (id, task) in self.writes.drain() {
                state.rows.insert(id, task);
            }
        }
        self.release();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.writes.clear();
        self.release();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_core::TaskStatus;
    use serde_json::json;
    use std::time::Duration;

    async fn seeded(n: usize) -> (InMemoryBackend, Vec<Task>) {
        let backend = InMemoryBackend::new();
        let base = chrono::Utc::now();
        let mut tasks = Vec::new();
        for i in 0..n {
            let task = Task::builder(json!(i))
                .created_at(base + chrono::Duration::milliseconds(i as i64))
                .build()
                .unwrap();
            backend.insert(&task).await.unwrap();
            tasks.push(task);
        }
        (backend, tasks)
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let (backend, tasks) = seeded(1).await;
        let err = backend.insert(&tasks[0]).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(id) if id == tasks[0].id));
    }

    #[tokio::test]
    async fn test_skip_locked_skips_rows_held_elsewhere() {
        let (backend, tasks) = seeded(2).await;
        let pending = TaskFilter::with_status(TaskStatus::Pending);

        let mut first = backend.begin().await.unwrap();
        let a = first
            .select_for_update_skip_locked(&pending, TaskOrder::CreatedAt, 1)
            .await
            .unwrap();
        assert_eq!(a[0].id, tasks[0].id);

        let mut second = backend.begin().await.unwrap();
        let b = second
            .select_for_update_skip_locked(&pending, TaskOrder::CreatedAt, 1)
            .await
            .unwrap();
        assert_eq!(b[0].id, tasks[1].id);

        let mut third = backend.begin().await.unwrap();
        let c = third
            .select_for_update_skip_locked(&pending, TaskOrder::CreatedAt, 1)
            .await
            .unwrap();
        assert!(c.is_empty());

        drop(first);
        let d = third
            .select_for_update_skip_locked(&pending, TaskOrder::CreatedAt, 1)
            .await
            .unwrap();
        assert_eq!(d[0].id, tasks[0].id);
    }

    #[tokio::test]
    async fn test_writes_visible_only_after_commit() {
        let (backend, tasks) = seeded(1).await;
        let mut tx = backend.begin().await.unwrap();
        let mut rows = tx
            .select_for_update(&TaskFilter::by_id(tasks[0].id), TaskOrder::CreatedAt, 1)
            .await
            .unwrap();
        let mut task = rows.remove(0);
        task.last_error = Some("edited".into());
        tx.update(&task).await.unwrap();

        let seen = backend.get(task.id).await.unwrap().unwrap();
        assert!(seen.last_error.is_none());

        tx.commit().await.unwrap();
        let seen = backend.get(task.id).await.unwrap().unwrap();
        assert_eq!(seen.last_error.as_deref(), Some("edited"));
        assert_eq!(backend.locked_rows(), 0);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let (backend, tasks) = seeded(1).await;
        let mut tx = backend.begin().await.unwrap();
        let mut task = tasks[0].clone();
        task.last_error = Some("discarded".into());
        tx.update(&task).await.unwrap();
        tx.rollback().await.unwrap();

        let seen = backend.get(task.id).await.unwrap().unwrap();
        assert!(seen.last_error.is_none());
        assert_eq!(backend.locked_rows(), 0);
    }

    #[tokio::test]
    async fn test_select_for_update_waits_for_release() {
        let (backend, tasks) = seeded(1).await;
        let filter = TaskFilter::by_id(tasks[0].id);

        let mut holder = backend.begin().await.unwrap();
        holder
            .select_for_update(&filter, TaskOrder::CreatedAt, 1)
            .await
            .unwrap();

        let waiter_backend = backend.clone();
        let waiter = tokio::spawn(async move {
            let mut tx = waiter_backend.begin().await.unwrap();
            let rows = tx
                .select_for_update(&filter, TaskOrder::CreatedAt, 1)
                .await
                .unwrap();
            tx.commit().await.unwrap();
            rows.len()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        holder.commit().await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, 1);
    }

    #[tokio::test]
    async fn test_offline_backend_is_unavailable() {
        let (backend, _) = seeded(1).await;
        backend.set_available(false);
        assert!(matches!(backend.ping().await, Err(StoreError::Unavailable(_))));
        assert!(backend.begin().await.is_err());

        backend.set_available(true);
        assert!(backend.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_list_and_purge() {
        let (backend, tasks) = seeded(3).await;

        let listed = backend.list(&TaskFilter::all(), 2, 0).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, tasks[2].id);

        let mut tx = backend.begin().await.unwrap();
        tx.select_for_update(&TaskFilter::by_id(tasks[0].id), TaskOrder::CreatedAt, 1)
            .await
            .unwrap();

        let purged = backend.purge(&TaskFilter::all()).await.unwrap();
        assert_eq!(purged, 2);
        drop(tx);

        let counts = backend.count_by_status().await.unwrap();
        assert_eq!(counts.pending, 1);
    }
}
