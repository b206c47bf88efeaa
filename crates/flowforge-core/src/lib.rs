mod duration;
mod error;
mod policy;
mod state;
mod task;

pub use duration::{parse_duration, parse_duration_secs};
pub use error::{Result, TaskError, TaskExecutionError};
pub use policy::{RetryPolicy, TimeoutAccounting};
pub use state::Transition;
pub use task::{Task, TaskBuilder, TaskId, TaskStatus};

/// Largest accepted serialized payload.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024; // 1MiB
