use crate::{Result, Task, TaskError, Transition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How lease expiries are charged against the attempt budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAccounting {
    /// Reaper requeues are tracked in `timeout_count` only and do not use up
    /// `max_attempts`.
    #[default]
    Separate,
    /// Every claim counts, including the ones that ended in a lease expiry.
    Shared,
}

impl fmt::Display for TimeoutAccounting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutAccounting::Separate => f.write_str("separate"),
            TimeoutAccounting::Shared => f.write_str("shared"),
        }
    }
}

impl FromStr for TimeoutAccounting {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "separate" => Ok(TimeoutAccounting::Separate),
            "shared" => Ok(TimeoutAccounting::Shared),
            other => Err(TaskError::InvalidPolicy(format!(
                "unknown timeout accounting '{}', expected 'separate' or 'shared'",
                other
            ))),
        }
    }
}

/// Decides where a failed or expired task goes next.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub timeout_accounting: TimeoutAccounting,
    /// Fail a task after this many lease expiries, regardless of accounting.
    pub max_timeouts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            timeout_accounting: TimeoutAccounting::Separate,
            max_timeouts: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_timeout_accounting(mut self, accounting: TimeoutAccounting) -> Self {
        self.timeout_accounting = accounting;
        self
    }

    pub fn with_max_timeouts(mut self, max_timeouts: Option<u32>) -> Self {
        self.max_timeouts = max_timeouts;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(TaskError::InvalidPolicy(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_timeouts == Some(0) {
            return Err(TaskError::InvalidPolicy(
                "max_timeouts must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Attempts counted against `max_attempts`.
    pub fn charged_attempts(&self, task: &Task) -> u32 {
        match self.timeout_accounting {
            TimeoutAccounting::Separate => task.attempt_count.saturating_sub(task.timeout_count),
            TimeoutAccounting::Shared => task.attempt_count,
        }
    }

    /// Transition for a failure reported by the claim holder.
    pub fn on_failure(&self, task: &Task, error: String, at: DateTime<Utc>) -> Transition {
        if self.charged_attempts(task) < self.max_attempts {
            Transition::Retry { error, at }
        } else {
            Transition::Fail { error, at }
        }
    }

    /// Transition for a claim whose lease ran out.
    pub fn on_lease_expired(&self, task: &Task, at: DateTime<Utc>) -> Transition {
        let timeouts = task.timeout_count + 1;
        if let Some(max) = self.max_timeouts {
            if timeouts >= max {
                return Transition::ExpireFail {
                    error: format!("lease expired {} times", timeouts),
                    at,
                };
            }
        }

        match self.timeout_accounting {
            TimeoutAccounting::Shared if task.attempt_count >= self.max_attempts => {
                Transition::ExpireFail {
                    error: format!("lease expired on final attempt {}", task.attempt_count),
                    at,
                }
            }
            _ => Transition::Expire { at },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskStatus;
    use serde_json::json;

    fn claimed_task(attempts: u32, timeouts: u32) -> Task {
        let mut task = Task::new(json!("x")).unwrap();
        task.status = TaskStatus::Processing;
        task.assigned_worker = Some("w".into());
        task.claimed_at = Some(Utc::now());
        task.attempt_count = attempts;
        task.timeout_count = timeouts;
        task
    }

    #[test]
    fn test_failure_retries_until_budget_spent() {
        let policy = RetryPolicy::new(2);
        let now = Utc::now();

        let first = policy.on_failure(&claimed_task(1, 0), "boom".into(), now);
        assert!(matches!(first, Transition::Retry { .. }));

        let second = policy.on_failure(&claimed_task(2, 0), "boom".into(), now);
        assert!(matches!(second, Transition::Fail { ref error, .. } if error == "boom"));
    }

    #[test]
    fn test_separate_accounting_ignores_timeouts() {
        let policy = RetryPolicy::new(2);
        let task = claimed_task(3, 2);

        assert_eq!(policy.charged_attempts(&task), 1);
        assert!(matches!(
            policy.on_failure(&task, "e".into(), Utc::now()),
            Transition::Retry { .. }
        ));
        assert!(matches!(
            policy.on_lease_expired(&task, Utc::now()),
            Transition::Expire { .. }
        ));
    }

    #[test]
    fn test_shared_accounting_charges_timeouts() {
        let policy = RetryPolicy::new(2).with_timeout_accounting(TimeoutAccounting::Shared);

        let task = claimed_task(2, 1);
        assert_eq!(policy.charged_attempts(&task), 2);
        assert!(matches!(
            policy.on_failure(&task, "e".into(), Utc::now()),
            Transition::Fail { .. }
        ));
        assert!(matches!(
            policy.on_lease_expired(&task, Utc::now()),
            Transition::ExpireFail { .. }
        ));
        assert!(matches!(
            policy.on_lease_expired(&claimed_task(1, 0), Utc::now()),
            Transition::Expire { .. }
        ));
    }

    #[test]
    fn test_max_timeouts_ceiling() {
        let policy = RetryPolicy::new(5).with_max_timeouts(Some(2));

        assert!(matches!(
            policy.on_lease_expired(&claimed_task(1, 0), Utc::now()),
            Transition::Expire { .. }
        ));
        assert!(matches!(
            policy.on_lease_expired(&claimed_task(2, 1), Utc::now()),
            Transition::ExpireFail { ref error, .. } if error.contains("2 times")
        ));
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::new(0).validate().is_err());
        assert!(RetryPolicy::new(1).with_max_timeouts(Some(0)).validate().is_err());
        assert_eq!(
            "shared".parse::<TimeoutAccounting>().unwrap(),
            TimeoutAccounting::Shared
        );
        assert!("both".parse::<TimeoutAccounting>().is_err());
    }
}
