mod client;
mod output;
mod seed;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use client::ApiClient;
use flowforge_core::TaskStatus;
use flowforge_store::{PgBackend, PgConfig, TaskBackend, TaskFilter};
use output::Format;
use serde::Serialize;
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(name = "ff-admin")]
#[command(about = "FlowForge admin CLI", long_about = None)]
struct Args {
    /// REST API address
    #[arg(long, env = "API_URL", default_value = "http://localhost:8080")]
    api: String,

    /// PostgreSQL connection string, for commands that talk to the store
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a new task
    Submit {
        /// Inline JSON payload
        #[arg(short, long, conflicts_with = "payload_file")]
        payload: Option<String>,

        /// File holding the JSON payload
        #[arg(long)]
        payload_file: Option<String>,
    },

    /// Get task status
    Status {
        /// Task ID
        task_id: String,
    },

    /// List tasks, newest first
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<TaskStatus>,

        /// Limit number of results
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Task counts per status
    Stats,

    /// Check the API service and the database
    Health,

    /// Insert sample tasks directly into the database
    Seed {
        #[arg(short, long, default_value = "20")]
        count: usize,

        /// Delete all existing tasks first
        #[arg(long)]
        clear: bool,
    },

    /// Delete tasks from the database
    Purge {
        /// Only delete tasks with this status
        #[arg(short, long)]
        status: Option<TaskStatus>,

        /// Required; without it nothing is deleted
        #[arg(long)]
        confirm: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Submit {
            payload,
            payload_file,
        } => {
            let raw = match (payload, payload_file) {
                (Some(inline), _) => inline,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading payload file {}", path))?,
                (None, None) => bail!("either --payload or --payload-file is required"),
            };
            let payload: Value =
                serde_json::from_str(&raw).context("payload is not valid JSON")?;

            let response = ApiClient::new(&args.api)?.submit(payload).await?;
            if !args.format.print_structured(&response)? {
                println!("Task submitted: {}", response["id"].as_str().unwrap_or("?"));
            }
        }

        Commands::Status { task_id } => {
            let task = ApiClient::new(&args.api)?.task(&task_id).await?;
            if !args.format.print_structured(&task)? {
                println!("{}", output::task_table(&task));
            }
        }

        Commands::List { status, limit } => {
            let tasks = ApiClient::new(&args.api)?
                .list(status.map(|s| s.as_str()), limit)
                .await?;
            if !args.format.print_structured(&tasks)? {
                println!("{}", output::task_list_table(&tasks));
            }
        }

        Commands::Stats => {
            let stats = ApiClient::new(&args.api)?.stats().await?;
            if !args.format.print_structured(&stats)? {
                println!("{}", output::stats_table(&stats));
            }
        }

        Commands::Health => {
            let checks = vec![
                check_api(&args.api).await,
                check_database(args.database_url.as_deref()).await,
            ];
            let healthy = checks.iter().all(|c| c.up);

            if !args.format.print_structured(&checks)? {
                for check in &checks {
                    println!("{}", check.line());
                }
                println!("{}", health_summary(&checks));
            }
            if !healthy {
                std::process::exit(1);
            }
        }

        Commands::Seed { count, clear } => {
            let backend = connect(args.database_url.as_deref()).await?;
            if clear {
                let deleted = backend.purge(&TaskFilter::all()).await?;
                println!("Cleared {} existing tasks", deleted);
            }

            let (tasks, counts) = seed::seed_tasks(count, Utc::now())?;
            for task in &tasks {
                backend.insert(task).await?;
            }
            backend.close().await;

            if !args.format.print_structured(&counts)? {
                println!("{}", seed::summary(&counts));
            }
        }

        Commands::Purge { status, confirm } => {
            let scope = match status {
                Some(status) => format!("all {} tasks", status),
                None => "ALL tasks".to_string(),
            };
            if !confirm {
                println!("WARNING: this will delete {} from the database.", scope);
                println!("Re-run with --confirm to proceed.");
                return Ok(());
            }

            let backend = connect(args.database_url.as_deref()).await?;
            let filter = TaskFilter {
                status,
                ..Default::default()
            };
            let deleted = backend.purge(&filter).await?;
            backend.close().await;
            println!("Deleted {} tasks from database", deleted);
        }
    }

    Ok(())
}

async fn connect(url: Option<&str>) -> anyhow::Result<PgBackend> {
    let Some(url) = url else {
        bail!("DATABASE_URL (or --database-url) is required for this command");
    };
    let config = PgConfig {
        url: url.to_string(),
        max_connections: 2,
        min_connections: 0,
        ..Default::default()
    };
    let backend = PgBackend::connect(&config).await?;
    backend.migrate().await?;
    Ok(backend)
}

#[derive(Debug, Serialize)]
struct ServiceCheck {
    service: &'static str,
    up: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl ServiceCheck {
    fn from_result(service: &'static str, result: anyhow::Result<()>) -> Self {
        ServiceCheck {
            service,
            up: result.is_ok(),
            reason: result.err().map(|e| format!("{:#}", e)),
        }
    }

    fn line(&self) -> String {
        match (&self.reason, self.up) {
            (_, true) => format!("{}: UP", self.service),
            (Some(reason), false) => format!("{}: DOWN ({})", self.service, reason),
            (None, false) => format!("{}: DOWN", self.service),
        }
    }
}

fn health_summary(checks: &[ServiceCheck]) -> String {
    let down = checks.iter().filter(|c| !c.up).count();
    if down == 0 {
        "All services healthy".to_string()
    } else {
        format!("{} of {} services unhealthy", down, checks.len())
    }
}

async fn check_api(api: &str) -> ServiceCheck {
    let result = match ApiClient::new(api) {
        Ok(client) => client.health().await,
        Err(e) => Err(e),
    };
    ServiceCheck::from_result("api-service", result)
}

async fn check_database(url: Option<&str>) -> ServiceCheck {
    let result = async {
        let Some(url) = url else {
            bail!("DATABASE_URL not set");
        };
        let config = PgConfig {
            url: url.to_string(),
            max_connections: 1,
            min_connections: 0,
            ..Default::default()
        };
        let backend = PgBackend::connect(&config).await?;
        let pinged = backend.ping().await;
        backend.close().await;
        pinged?;
        Ok(())
    }
    .await;
    ServiceCheck::from_result("postgresql", result)
}
