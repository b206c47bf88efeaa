use chrono::{DateTime, Duration, Utc};
use flowforge_core::{Task, TaskStatus, Transition};
use flowforge_store::StatusCounts;
use serde_json::json;

/// Status for the `index`-th seeded task.
///
/// Repeats a ten-task pattern: four pending, two processing, three completed
/// and one failed.
pub fn seed_status(index: usize) -> TaskStatus {
    match index % 10 {
        0..=3 => TaskStatus::Pending,
        4 | 5 => TaskStatus::Processing,
        6..=8 => TaskStatus::Completed,
        _ => TaskStatus::Failed,
    }
}

/// Build a seeded task by walking it through the state machine.
pub fn seed_task(index: usize, now: DateTime<Utc>) -> anyhow::Result<Task> {
    let created = now - Duration::minutes(60) + Duration::seconds(index as i64);
    let mut task = Task::builder(json!({
        "job": "seed",
        "n": index,
        "sleep_ms": 100 * (index % 5 + 1),
    }))
    .created_at(created)
    .build()?;

    let status = seed_status(index);
    if status == TaskStatus::Pending {
        return Ok(task);
    }

    let claimed = created + Duration::seconds(5);
    task.apply(Transition::Claim {
        worker_id: format!("seed-worker-{}", index % 3),
        at: claimed,
    })?;

    let finished = claimed + Duration::seconds(2);
    match status {
        TaskStatus::Completed => task.apply(Transition::Complete { at: finished })?,
        TaskStatus::Failed => task.apply(Transition::Fail {
            error: "seeded failure".to_string(),
            at: finished,
        })?,
        _ => {}
    }
    Ok(task)
}

pub fn seed_tasks(count: usize, now: DateTime<Utc>) -> anyhow::Result<(Vec<Task>, StatusCounts)> {
    let mut counts = StatusCounts::default();
    let mut tasks = Vec::with_capacity(count);
    for index in 0..count {
        let task = seed_task(index, now)?;
        counts.add(task.status, 1);
        tasks.push(task);
    }
    Ok((tasks, counts))
}

pub fn summary(counts: &StatusCounts) -> String {
    format!(
        "Created {} tasks ({} pending, {} processing, {} completed, {} failed)",
        counts.total(),
        counts.pending,
        counts.processing,
        counts.completed,
        counts.failed
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_mix() {
        let (tasks, counts) = seed_tasks(20, Utc::now()).unwrap();
        assert_eq!(tasks.len(), 20);
        assert_eq!(
            summary(&counts),
            "Created 20 tasks (8 pending, 4 processing, 6 completed, 2 failed)"
        );
    }

    #[test]
    fn test_seeded_tasks_respect_invariants() {
        let (tasks, _) = seed_tasks(10, Utc::now()).unwrap();
        for task in tasks {
            match task.status {
                TaskStatus::Pending => {
                    assert_eq!(task.attempt_count, 0);
                    assert!(task.assigned_worker.is_none());
                }
                TaskStatus::Processing => {
                    assert_eq!(task.attempt_count, 1);
                    assert!(task.assigned_worker.is_some());
                    assert!(task.claimed_at.is_some());
                }
                TaskStatus::Completed => {
                    assert!(task.assigned_worker.is_none());
                    assert!(task.last_error.is_none());
                }
                TaskStatus::Failed => {
                    assert_eq!(task.last_error.as_deref(), Some("seeded failure"));
                }
            }
        }
    }
}
