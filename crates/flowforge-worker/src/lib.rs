pub mod backoff;
pub mod config;
pub mod executor;
pub mod handler;
pub mod worker;

pub use backoff::Backoff;
pub use config::{WorkerArgs, WorkerConfig};
pub use executor::{Outcome, TaskExecutor};
pub use handler::{SimulatedWorkHandler, TaskHandler, TaskResult};
pub use worker::{Worker, WorkerStats};
