use async_trait::async_trait;
use flowforge_core::{Task, TaskExecutionError};
use std::future::Future;
use std::time::Duration;

/// Result type for task handlers
pub type TaskResult = Result<(), TaskExecutionError>;

/// The work function run for every claimed task
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, task: &Task) -> TaskResult;
}

/// Any `Fn(Task) -> impl Future<Output = TaskResult>` closure is a handler.
#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = TaskResult> + Send,
{
    async fn execute(&self, task: &Task) -> TaskResult {
        (self)(task.clone()).await
    }
}

/// Stand-in handler that simulates work by sleeping.
///
/// Payload conventions:
/// - `{"sleep_ms": n}` overrides the sleep duration
/// - `{"fail": "reason"}` or the string `"fail"` makes the task fail
pub struct SimulatedWorkHandler {
    duration: Duration,
}

impl SimulatedWorkHandler {
    pub fn new(duration: Duration) -> Self {
        SimulatedWorkHandler { duration }
    }
}

#[async_trait]
impl TaskHandler for SimulatedWorkHandler {
    async fn execute(&self, task: &Task) -> TaskResult {
        let payload = &task.payload;
        let duration = payload
            .get("sleep_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(self.duration);

        tokio::time::sleep(duration).await;

        if payload.as_str() == Some("fail") {
            return Err(TaskExecutionError::new("simulated failure"));
        }
        if let Some(reason) = payload.get("fail") {
            let reason = reason
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| reason.to_string());
            return Err(TaskExecutionError::new(reason));
        }
        Ok(())
    }
}
