use crate::backoff::Backoff;
use crate::handler::{TaskHandler, TaskResult};
use flowforge_core::{TaskExecutionError, TaskStatus};
use flowforge_store::{Claim, TaskQueue};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::task::AbortOnDropHandle;
use tracing::{error, info, warn};

/// What happened to a claim after processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Completed,
    /// Failed with attempts left; back to pending
    Retrying,
    Failed,
    /// No report reached the store; the reaper will recover the task
    Unreported,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Completed => "completed",
            Outcome::Retrying => "retrying",
            Outcome::Failed => "failed",
            Outcome::Unreported => "unreported",
        };
        f.write_str(s)
    }
}

/// Holds a claim until it has been reported.
///
/// If the guard is dropped while still armed (the processing future was
/// cancelled or unwound) the claim is released back to `pending` on a
/// background task.
struct ClaimGuard {
    queue: TaskQueue,
    claim: Option<Claim>,
}

impl ClaimGuard {
    fn new(queue: TaskQueue, claim: Claim) -> Self {
        ClaimGuard {
            queue,
            claim: Some(claim),
        }
    }

    fn disarm(&mut self) {
        self.claim = None;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let Some(claim) = self.claim.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(task_id = %claim.task_id(), "No runtime to release claim; leaving it to the reaper");
            return;
        };
        let queue = self.queue.clone();
        handle.spawn(async move {
            if let Err(e) = queue.release(&claim).await {
                warn!(
                    task_id = %claim.task_id(),
                    worker_id = claim.worker_id(),
                    "Failed to release abandoned claim: {}",
                    e
                );
            }
        });
    }
}

/// Runs the handler for a claim and reports exactly one outcome.
pub struct TaskExecutor {
    queue: TaskQueue,
    handler: Arc<dyn TaskHandler>,
    task_timeout: Option<Duration>,
    report_retries: u32,
    report_backoff: Backoff,
}

impl TaskExecutor {
    pub fn new(queue: TaskQueue, handler: Arc<dyn TaskHandler>) -> Self {
        TaskExecutor {
            queue,
            handler,
            task_timeout: None,
            report_retries: 5,
            report_backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(5)),
        }
    }

    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_report_retries(mut self, retries: u32, backoff: Backoff) -> Self {
        self.report_retries = retries;
        self.report_backoff = backoff;
        self
    }

    /// Execute the claimed task and report its outcome.
    pub async fn process(&self, claim: Claim) -> Outcome {
        let mut guard = ClaimGuard::new(self.queue.clone(), claim.clone());
        let started = Instant::now();

        let result = self.run_handler(&claim).await;
        let outcome = self.report(&claim, &result).await;
        guard.disarm();

        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => info!(
                task_id = %claim.task_id(),
                worker_id = claim.worker_id(),
                attempt = claim.attempt(),
                outcome = %outcome,
                duration_ms,
                "Task processed"
            ),
            Err(e) => info!(
                task_id = %claim.task_id(),
                worker_id = claim.worker_id(),
                attempt = claim.attempt(),
                outcome = %outcome,
                duration_ms,
                error = %e,
                "Task processed"
            ),
        }
        outcome
    }

    /// Run the handler on its own task so panics and timeouts become failures.
    async fn run_handler(&self, claim: &Claim) -> TaskResult {
        let handler = self.handler.clone();
        let task = claim.task().clone();
        let mut join = AbortOnDropHandle::new(tokio::spawn(async move {
            handler.execute(&task).await
        }));

        let joined = match self.task_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut join).await {
                Ok(joined) => joined,
                Err(_) => {
                    join.abort();
                    return Err(TaskExecutionError::new(format!(
                        "task timed out after {}ms",
                        limit.as_millis()
                    )));
                }
            },
            None => join.await,
        };

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(TaskExecutionError::new(format!(
                "task panicked: {}",
                panic_message(e.into_panic())
            ))),
            Err(_) => Err(TaskExecutionError::new("task was cancelled")),
        }
    }

    async fn report(&self, claim: &Claim, result: &TaskResult) -> Outcome {
        let mut retries = 0;
        loop {
            let reported = match result {
                Ok(()) => self.queue.report_success(claim).await,
                Err(e) => self.queue.report_failure(claim, e).await,
            };

            match reported {
                Ok(task) => {
                    return match task.status {
                        TaskStatus::Completed => Outcome::Completed,
                        TaskStatus::Pending => Outcome::Retrying,
                        TaskStatus::Failed => Outcome::Failed,
                        TaskStatus::Processing => Outcome::Unreported,
                    }
                }
                Err(e) if e.is_transient() && retries < self.report_retries => {
                    retries += 1;
                    let delay = self.report_backoff.delay(retries);
                    warn!(
                        task_id = %claim.task_id(),
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        "Report failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        task_id = %claim.task_id(),
                        worker_id = claim.worker_id(),
                        attempt = claim.attempt(),
                        "Could not report task outcome: {}",
                        e
                    );
                    return Outcome::Unreported;
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::SimulatedWorkHandler;
    use flowforge_core::{RetryPolicy, Task};
    use flowforge_store::InMemoryBackend;
    use serde_json::json;

    fn setup(max_attempts: u32) -> (InMemoryBackend, TaskQueue) {
        let backend = InMemoryBackend::new();
        let queue = TaskQueue::new(Arc::new(backend.clone()), RetryPolicy::new(max_attempts));
        (backend, queue)
    }

    fn quick_handler() -> Arc<dyn TaskHandler> {
        Arc::new(SimulatedWorkHandler::new(Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_executor_success() {
        let (_, queue) = setup(3);
        let task = queue.submit(json!("ok")).await.unwrap();
        let claim = queue.claim_next("w1").await.unwrap().unwrap();

        let executor = TaskExecutor::new(queue.clone(), quick_handler());
        assert_eq!(executor.process(claim).await, Outcome::Completed);
        assert_eq!(queue.get(task.id).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_executor_failure_retries_then_fails() {
        let (_, queue) = setup(2);
        let task = queue.submit(json!("fail")).await.unwrap();
        let executor = TaskExecutor::new(queue.clone(), quick_handler());

        let claim = queue.claim_next("w1").await.unwrap().unwrap();
        assert_eq!(executor.process(claim).await, Outcome::Retrying);

        let claim = queue.claim_next("w1").await.unwrap().unwrap();
        assert_eq!(executor.process(claim).await, Outcome::Failed);

        let stored = queue.get(task.id).await.unwrap();
        assert_eq!(stored.last_error.as_deref(), Some("simulated failure"));
    }

    #[tokio::test]
    async fn test_executor_panic_becomes_failure() {
        let (_, queue) = setup(1);
        let task = queue.submit(json!(null)).await.unwrap();
        let claim = queue.claim_next("w1").await.unwrap().unwrap();

        let handler = |_task: Task| async move {
            if true {
                panic!("handler exploded");
            }
            Ok::<(), TaskExecutionError>(())
        };
        let executor = TaskExecutor::new(queue.clone(), Arc::new(handler));
        assert_eq!(executor.process(claim).await, Outcome::Failed);

        let stored = queue.get(task.id).await.unwrap();
        assert!(stored.last_error.unwrap().contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_executor_timeout() {
        let (_, queue) = setup(1);
        let task = queue.submit(json!({"sleep_ms": 2000})).await.unwrap();
        let claim = queue.claim_next("w1").await.unwrap().unwrap();

        let executor = TaskExecutor::new(queue.clone(), quick_handler())
            .with_task_timeout(Some(Duration::from_millis(20)));
        assert_eq!(executor.process(claim).await, Outcome::Failed);

        let stored = queue.get(task.id).await.unwrap();
        assert!(stored.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancelled_processing_releases_claim() {
        let (_, queue) = setup(3);
        let task = queue.submit(json!({"sleep_ms": 5000})).await.unwrap();
        let claim = queue.claim_next("w1").await.unwrap().unwrap();

        let executor = TaskExecutor::new(queue.clone(), quick_handler());
        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), executor.process(claim)).await;
        assert!(cancelled.is_err());

        let mut released = false;
        for _ in 0..50 {
            if queue.get(task.id).await.unwrap().status == TaskStatus::Pending {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(released, "claim was not released");
        let stored = queue.get(task.id).await.unwrap();
        assert!(stored.assigned_worker.is_none());
        assert_eq!(stored.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_report_retries_through_outage() {
        let (backend, queue) = setup(3);
        let task = queue.submit(json!({"sleep_ms": 30})).await.unwrap();
        let claim = queue.claim_next("w1").await.unwrap().unwrap();

        let executor = TaskExecutor::new(queue.clone(), quick_handler()).with_report_retries(
            10,
            Backoff::new(Duration::from_millis(10), Duration::from_millis(20)),
        );

        backend.set_available(false);
        let restore = {
            let backend = backend.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                backend.set_available(true);
            })
        };

        assert_eq!(executor.process(claim).await, Outcome::Completed);
        restore.await.unwrap();
        assert_eq!(queue.get(task.id).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_lost_claim_is_not_retried() {
        let (_, queue) = setup(3);
        queue.submit(json!("x")).await.unwrap();
        let claim = queue.claim_next("w1").await.unwrap().unwrap();
        queue.release(&claim).await.unwrap();

        let executor = TaskExecutor::new(queue.clone(), quick_handler());
        assert_eq!(executor.process(claim).await, Outcome::Unreported);
    }
}
