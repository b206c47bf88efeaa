use crate::TaskStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Payload size exceeds maximum allowed size of {max} bytes (got {actual})")]
    PayloadTooLarge { max: usize, actual: usize },

    #[error("Invalid retry policy: {0}")]
    InvalidPolicy(String),

    #[error("Unknown task status: {0}")]
    UnknownStatus(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TaskError {
    /// True for state machine violations, which callers must surface rather than retry.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, TaskError::InvalidTransition { .. })
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;

/// Business failure raised by a work function.
///
/// It is recorded on the task through a failure report and never escalates
/// into a worker process fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TaskExecutionError(String);

impl TaskExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        TaskExecutionError(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskExecutionError {
    fn from(message: String) -> Self {
        TaskExecutionError(message)
    }
}

impl From<&str> for TaskExecutionError {
    fn from(message: &str) -> Self {
        TaskExecutionError(message.to_string())
    }
}
