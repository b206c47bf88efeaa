use crate::{Result, TaskError, MAX_PAYLOAD_SIZE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a task
pub type TaskId = Uuid;

/// Task status in the queue system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is waiting to be claimed by a worker
    Pending,
    /// Task is held by exactly one worker
    Processing,
    /// Task completed successfully
    Completed,
    /// Task exhausted its attempt budget
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(TaskError::UnknownStatus(other.to_string())),
        }
    }
}

/// A unit of work persisted in the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,

    /// Current status
    pub status: TaskStatus,

    /// Opaque work description, interpreted only by handlers
    pub payload: serde_json::Value,

    /// When the task was submitted
    pub created_at: DateTime<Utc>,

    /// When the current claim was taken (set only while processing)
    pub claimed_at: Option<DateTime<Utc>>,

    /// Worker holding the current claim (set only while processing)
    pub assigned_worker: Option<String>,

    /// Number of times the task has been claimed
    pub attempt_count: u32,

    /// Number of times a lease expired and the reaper requeued the task
    pub timeout_count: u32,

    /// Most recent failure message
    pub last_error: Option<String>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new pending task
    pub fn new(payload: serde_json::Value) -> Result<Self> {
        TaskBuilder::new(payload).build()
    }

    /// Create a new task builder
    pub fn builder(payload: serde_json::Value) -> TaskBuilder {
        TaskBuilder::new(payload)
    }

    /// Whether the current claim is older than `lease` at `now`.
    pub fn is_lease_expired(&self, lease: chrono::Duration, now: DateTime<Utc>) -> bool {
        match (self.status, self.claimed_at) {
            (TaskStatus::Processing, Some(claimed_at)) => claimed_at + lease < now,
            _ => false,
        }
    }

    /// Serialized size of the payload in bytes
    pub fn payload_size(&self) -> Result<usize> {
        Ok(serde_json::to_vec(&self.payload)?.len())
    }
}

/// Builder for tasks with explicit identity or creation time
pub struct TaskBuilder {
    id: Option<TaskId>,
    payload: serde_json::Value,
    created_at: Option<DateTime<Utc>>,
}

impl TaskBuilder {
    pub fn new(payload: serde_json::Value) -> Self {
        TaskBuilder {
            id: None,
            payload,
            created_at: None,
        }
    }

    pub fn id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn build(self) -> Result<Task> {
        let size = serde_json::to_vec(&self.payload)?.len();
        if size > MAX_PAYLOAD_SIZE {
            return Err(TaskError::PayloadTooLarge {
                max: MAX_PAYLOAD_SIZE,
                actual: size,
            });
        }

        let now = Utc::now();
        let created_at = self.created_at.unwrap_or(now);
        Ok(Task {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            status: TaskStatus::Pending,
            payload: self.payload,
            created_at,
            claimed_at: None,
            assigned_worker: None,
            attempt_count: 0,
            timeout_count: 0,
            last_error: None,
            updated_at: created_at,
        })
    }
}
