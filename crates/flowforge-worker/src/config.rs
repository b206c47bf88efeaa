use anyhow::{bail, Context};
use clap::Parser;
use flowforge_core::{parse_duration, parse_duration_secs, RetryPolicy, TimeoutAccounting};
use flowforge_store::PgConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub database: PgConfig,
    pub worker_id: Option<String>,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub timeout_accounting: TimeoutAccounting,
    pub max_timeouts: Option<u32>,
    pub lease_duration_secs: u64,
    pub task_timeout_secs: Option<u64>,
    pub graceful_shutdown_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub run_reaper: bool,
    pub reaper_interval_secs: u64,
    /// How long the built-in simulated handler works on each task
    pub work_duration_ms: u64,
    pub log_level: String,
    pub log_format: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            database: PgConfig::default(),
            worker_id: None,
            concurrency: 1,
            poll_interval_ms: 5_000,
            max_attempts: 3,
            timeout_accounting: TimeoutAccounting::Separate,
            max_timeouts: None,
            lease_duration_secs: 300,
            task_timeout_secs: None,
            graceful_shutdown_timeout_secs: 30,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            run_reaper: false,
            reaper_interval_secs: 30,
            work_duration_ms: 1_000,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading worker config {}", path))?;
        let config: WorkerConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing worker config {}", path))?;
        Ok(config)
    }

    /// Reject settings the worker cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.trim().is_empty() {
            bail!("DATABASE_URL is required");
        }
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            bail!("poll interval must be greater than zero");
        }
        if self.lease_duration_secs == 0 {
            bail!("lease duration must be greater than zero");
        }
        if self.run_reaper && self.reaper_interval_secs == 0 {
            bail!("reaper interval must be greater than zero");
        }
        if let Some(timeout) = self.task_timeout_secs {
            if timeout == 0 || timeout >= self.lease_duration_secs {
                bail!(
                    "task timeout ({}s) must be between 1s and the lease duration ({}s)",
                    timeout,
                    self.lease_duration_secs
                );
            }
        }
        if self.backoff_base_ms == 0 || self.backoff_base_ms > self.backoff_max_ms {
            bail!(
                "backoff base ({}ms) must be non-zero and not exceed backoff max ({}ms)",
                self.backoff_base_ms,
                self.backoff_max_ms
            );
        }
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            bail!("log format must be 'pretty' or 'json', got '{}'", self.log_format);
        }
        self.retry_policy().validate()?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
            .with_timeout_accounting(self.timeout_accounting)
            .with_max_timeouts(self.max_timeouts)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    pub fn generate_worker_id(&self) -> String {
        use std::process;
        use uuid::Uuid;

        if let Some(id) = &self.worker_id {
            return id.clone();
        }

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let pid = process::id();
        let random = Uuid::new_v4().simple().to_string();

        format!("{}-{}-{}", hostname, pid, &random[..8])
    }
}

/// Command line and environment overrides for [`WorkerConfig`].
#[derive(Parser, Debug, Default)]
#[command(name = "ff-worker")]
#[command(about = "FlowForge task worker", long_about = None)]
pub struct WorkerArgs {
    /// Path to a YAML configuration file
    #[arg(long, env = "WORKER_CONFIG")]
    pub config: Option<String>,

    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: Option<u32>,

    #[arg(long, env = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: Option<u32>,

    #[arg(long, env = "DATABASE_ACQUIRE_TIMEOUT", value_parser = parse_duration_secs)]
    pub database_acquire_timeout: Option<u64>,

    #[arg(long, env = "DATABASE_MAX_LIFETIME", value_parser = parse_duration_secs)]
    pub database_max_lifetime: Option<u64>,

    /// Worker ID (auto-generated if not provided)
    #[arg(long, env = "WORKER_ID")]
    pub worker_id: Option<String>,

    /// Number of concurrent poll loops
    #[arg(short, long, env = "WORKER_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Sleep between polls of an empty queue (e.g. 500ms, 5s)
    #[arg(long, env = "WORKER_POLL_INTERVAL", value_parser = parse_duration)]
    pub poll_interval: Option<Duration>,

    #[arg(long, env = "WORKER_MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,

    /// Whether lease expiries use up attempts: separate or shared
    #[arg(long, env = "WORKER_TIMEOUT_ACCOUNTING")]
    pub timeout_accounting: Option<TimeoutAccounting>,

    #[arg(long, env = "WORKER_MAX_TIMEOUTS")]
    pub max_timeouts: Option<u32>,

    /// Claims older than this are considered abandoned
    #[arg(long, env = "WORKER_LEASE_DURATION", value_parser = parse_duration_secs)]
    pub lease_duration: Option<u64>,

    /// Abort a single task after this long
    #[arg(long, env = "WORKER_TASK_TIMEOUT", value_parser = parse_duration_secs)]
    pub task_timeout: Option<u64>,

    /// How long in-flight tasks may run after a shutdown signal
    #[arg(long, env = "WORKER_SHUTDOWN_TIMEOUT", value_parser = parse_duration_secs)]
    pub shutdown_timeout: Option<u64>,

    #[arg(long, env = "WORKER_BACKOFF_BASE", value_parser = parse_duration)]
    pub backoff_base: Option<Duration>,

    #[arg(long, env = "WORKER_BACKOFF_MAX", value_parser = parse_duration)]
    pub backoff_max: Option<Duration>,

    /// Also run the stale-claim reaper in this process
    #[arg(long, env = "WORKER_RUN_REAPER")]
    pub run_reaper: Option<bool>,

    #[arg(long, env = "WORKER_REAPER_INTERVAL", value_parser = parse_duration_secs)]
    pub reaper_interval: Option<u64>,

    #[arg(long, env = "WORKER_WORK_DURATION", value_parser = parse_duration)]
    pub work_duration: Option<Duration>,

    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// pretty or json
    #[arg(long, env = "LOG_FORMAT")]
    pub log_format: Option<String>,
}

impl WorkerArgs {
    /// Load the file (if any), apply overrides and validate.
    pub fn into_config(self) -> anyhow::Result<WorkerConfig> {
        let mut config = match &self.config {
            Some(path) => WorkerConfig::from_file(path)?,
            None => WorkerConfig::default(),
        };
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply(self, config: &mut WorkerConfig) {
        if let Some(url) = self.database_url {
            config.database.url = url;
        }
        if let Some(n) = self.database_max_connections {
            config.database.max_connections = n;
        }
        if let Some(n) = self.database_min_connections {
            config.database.min_connections = n;
        }
        if let Some(timeout) = self.database_acquire_timeout {
            config.database.acquire_timeout_secs = timeout;
        }
        if let Some(lifetime) = self.database_max_lifetime {
            config.database.max_lifetime_secs = lifetime;
        }
        if let Some(worker_id) = self.worker_id {
            config.worker_id = Some(worker_id);
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(interval) = self.poll_interval {
            config.poll_interval_ms = interval.as_millis() as u64;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.max_attempts = max_attempts;
        }
        if let Some(accounting) = self.timeout_accounting {
            config.timeout_accounting = accounting;
        }
        if self.max_timeouts.is_some() {
            config.max_timeouts = self.max_timeouts;
        }
        if let Some(lease) = self.lease_duration {
            config.lease_duration_secs = lease;
        }
        if let Some(timeout) = self.task_timeout {
            config.task_timeout_secs = Some(timeout);
        }
        if let Some(timeout) = self.shutdown_timeout {
            config.graceful_shutdown_timeout_secs = timeout;
        }
        if let Some(base) = self.backoff_base {
            config.backoff_base_ms = base.as_millis() as u64;
        }
        if let Some(max) = self.backoff_max {
            config.backoff_max_ms = max.as_millis() as u64;
        }
        if let Some(run_reaper) = self.run_reaper {
            config.run_reaper = run_reaper;
        }
        if let Some(interval) = self.reaper_interval {
            config.reaper_interval_secs = interval;
        }
        if let Some(work) = self.work_duration {
            config.work_duration_ms = work.as_millis() as u64;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
    }
}
