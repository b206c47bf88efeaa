//! Durable task storage and the queue operations built on it.
//!
//! [`TaskBackend`] is the thin transactional contract a store must offer;
//! [`TaskQueue`] layers submission, claiming and outcome reporting on top of
//! it, and [`Reaper`] recovers claims whose lease ran out.

mod backend;
mod claim;
mod memory;
mod postgres;
mod queue;
mod reaper;

pub use backend::{StatusCounts, StoreTransaction, TaskBackend, TaskFilter, TaskOrder};
pub use claim::Claim;
pub use memory::InMemoryBackend;
pub use postgres::{PgBackend, PgConfig};
pub use queue::TaskQueue;
pub use reaper::{ReapReport, Reaper};

use flowforge_core::{TaskError, TaskId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Transaction conflict: {0}")]
    Conflict(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task already exists: {0}")]
    AlreadyExists(TaskId),

    #[error("Claim on task {task_id} is no longer held by {worker_id}")]
    ClaimLost { task_id: TaskId, worker_id: String },

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Corrupt task row {task_id}: {reason}")]
    Corrupt { task_id: TaskId, reason: String },

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Database error: {0}")]
    Database(sqlx::Error),
}

impl StoreError {
    /// Errors a caller should retry after a pause (or immediately, for conflicts).
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Conflict(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, StoreError::Task(e) if e.is_invalid_transition())
    }
}

/// SQLSTATE codes for serialization failure, deadlock and lock_not_available.
const CONFLICT_CODES: [&str; 3] = ["40001", "40P01", "55P03"];

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            let code = db.code().map(|c| c.into_owned());
            match code.as_deref() {
                Some(c) if CONFLICT_CODES.contains(&c) => {
                    return StoreError::Conflict(db.to_string())
                }
                // admin_shutdown, cannot_connect_now, too_many_connections
                Some("57P01") | Some("57P03") | Some("53300") => {
                    return StoreError::Unavailable(db.to_string())
                }
                _ => {}
            }
        }

        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            other => StoreError::Database(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
