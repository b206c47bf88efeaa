use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Table,
    Json,
    Yaml,
}

impl Format {
    /// Print `value` as JSON or YAML. Returns false for table output, which
    /// each command renders itself.
    pub fn print_structured<T: Serialize>(&self, value: &T) -> anyhow::Result<bool> {
        match self {
            Format::Json => println!("{}", serde_json::to_string_pretty(value)?),
            Format::Yaml => print!("{}", serde_yaml::to_string(value)?),
            Format::Table => return Ok(false),
        }
        Ok(true)
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn task_table(task: &Value) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Field", "Value"]);
    for (label, key) in [
        ("ID", "id"),
        ("Status", "status"),
        ("Created", "created_at"),
        ("Updated", "updated_at"),
        ("Claimed", "claimed_at"),
        ("Worker", "assigned_worker"),
        ("Attempts", "attempt_count"),
        ("Timeouts", "timeout_count"),
        ("Last Error", "last_error"),
        ("Payload", "payload"),
    ] {
        table.add_row(vec![label.to_string(), text(&task[key])]);
    }
    table
}

pub fn task_list_table(tasks: &[Value]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["ID", "Status", "Attempts", "Worker", "Created"]);
    for task in tasks {
        table.add_row(vec![
            text(&task["id"]),
            text(&task["status"]),
            text(&task["attempt_count"]),
            text(&task["assigned_worker"]),
            text(&task["created_at"]),
        ]);
    }
    table
}

pub fn stats_table(stats: &Value) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Status", "Tasks"]);
    for (label, key) in [
        ("Pending", "pending"),
        ("Processing", "processing"),
        ("Completed", "completed"),
        ("Failed", "failed"),
        ("Total", "total"),
    ] {
        table.add_row(vec![label.to_string(), text(&stats[key])]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_table_renders_nulls_as_dash() {
        let task = json!({
            "id": "7f1d",
            "status": "pending",
            "attempt_count": 0,
            "assigned_worker": null,
        });
        let rendered = task_table(&task).to_string();
        assert!(rendered.contains("7f1d"));
        assert!(rendered.contains("pending"));
        assert!(rendered.contains("-"));
    }

    #[test]
    fn test_stats_table() {
        let stats = json!({"pending": 2, "processing": 1, "completed": 5, "failed": 0, "total": 8});
        let rendered = stats_table(&stats).to_string();
        assert!(rendered.contains("Completed"));
        assert!(rendered.contains('8'));
    }
}
