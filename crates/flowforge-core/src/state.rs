//! Task lifecycle state machine.
//!
//! ```text
//!   pending ──claim──▶ processing ──complete──▶ completed
//!      ▲                   │
//!      └─retry/expire/─────┤
//!          release         └──fail──▶ failed
//! ```
//!
//! Every mutation of a task's status goes through [`Task::apply`], which
//! validates the edge before touching any field.

use crate::{Result, Task, TaskError, TaskStatus};
use chrono::{DateTime, Utc};

/// A requested change to a task's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// A worker takes the task.
    Claim { worker_id: String, at: DateTime<Utc> },
    /// The holder reports success.
    Complete { at: DateTime<Utc> },
    /// The holder reports a failure with budget remaining.
    Retry { error: String, at: DateTime<Utc> },
    /// The task is out of budget.
    Fail { error: String, at: DateTime<Utc> },
    /// The reaper found the lease expired.
    Expire { at: DateTime<Utc> },
    /// The lease expired and the task has no budget left for another try.
    ExpireFail { error: String, at: DateTime<Utc> },
    /// The holder abandoned the claim without reporting.
    Release { at: DateTime<Utc> },
}

impl Transition {
    pub fn from_status(&self) -> TaskStatus {
        match self {
            Transition::Claim { .. } => TaskStatus::Pending,
            _ => TaskStatus::Processing,
        }
    }

    pub fn to_status(&self) -> TaskStatus {
        match self {
            Transition::Claim { .. } => TaskStatus::Processing,
            Transition::Complete { .. } => TaskStatus::Completed,
            Transition::Fail { .. } | Transition::ExpireFail { .. } => TaskStatus::Failed,
            Transition::Retry { .. } | Transition::Expire { .. } | Transition::Release { .. } => {
                TaskStatus::Pending
            }
        }
    }

    fn at(&self) -> DateTime<Utc> {
        match self {
            Transition::Claim { at, .. }
            | Transition::Complete { at }
            | Transition::Retry { at, .. }
            | Transition::Fail { at, .. }
            | Transition::Expire { at }
            | Transition::ExpireFail { at, .. }
            | Transition::Release { at } => *at,
        }
    }
}

impl TaskStatus {
    /// Whether the lifecycle has an edge from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Pending)
                | (Processing, Failed)
        )
    }
}

impl Task {
    /// Apply a transition, or leave the task untouched and return
    /// `InvalidTransition` when the task is not in the edge's source status.
    pub fn apply(&mut self, transition: Transition) -> Result<()> {
        let to = transition.to_status();
        if self.status != transition.from_status() || !self.status.can_transition_to(to) {
            return Err(TaskError::InvalidTransition {
                from: self.status,
                to,
            });
        }

        self.updated_at = transition.at();
        match transition {
            Transition::Claim { worker_id, at } => {
                self.assigned_worker = Some(worker_id);
                self.claimed_at = Some(at);
                self.attempt_count += 1;
            }
            Transition::Complete { .. } | Transition::Release { .. } => {
                self.clear_claim();
            }
            Transition::Retry { error, .. } | Transition::Fail { error, .. } => {
                self.last_error = Some(error);
                self.clear_claim();
            }
            Transition::Expire { .. } => {
                self.timeout_count += 1;
                self.clear_claim();
            }
            Transition::ExpireFail { error, .. } => {
                self.timeout_count += 1;
                self.last_error = Some(error);
                self.clear_claim();
            }
        }
        self.status = to;
        Ok(())
    }

    fn clear_claim(&mut self) {
        self.assigned_worker = None;
        self.claimed_at = None;
    }
}
