use anyhow::{bail, Context};
use clap::Parser;
use flowforge_core::{parse_duration_secs, RetryPolicy, TimeoutAccounting};
use flowforge_store::PgConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub database: PgConfig,
    pub host: String,
    pub port: u16,
    pub metrics_port: u16,
    pub reaper: ReaperConfig,
    /// How often the task gauges are refreshed from the store
    pub stats_refresh_secs: u64,
    /// Retry policy the reaper applies; must match the workers'
    pub max_attempts: u32,
    pub timeout_accounting: TimeoutAccounting,
    pub max_timeouts: Option<u32>,
    pub log_level: String,
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub lease_duration_secs: u64,
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        ReaperConfig {
            enabled: true,
            interval_secs: 30,
            lease_duration_secs: 300,
            batch_size: 100,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            database: PgConfig::default(),
            host: "0.0.0.0".to_string(),
            port: 8080,
            metrics_port: 9091,
            reaper: ReaperConfig::default(),
            stats_refresh_secs: 15,
            max_attempts: 3,
            timeout_accounting: TimeoutAccounting::Separate,
            max_timeouts: None,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl ApiConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading api config {}", path))?;
        let config: ApiConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing api config {}", path))?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.trim().is_empty() {
            bail!("DATABASE_URL is required");
        }
        if self.port == self.metrics_port {
            bail!("API port and metrics port must differ (both {})", self.port);
        }
        if self.reaper.enabled {
            if self.reaper.interval_secs == 0 {
                bail!("reaper interval must be greater than zero");
            }
            if self.reaper.lease_duration_secs == 0 {
                bail!("reaper lease duration must be greater than zero");
            }
            if self.reaper.batch_size == 0 {
                bail!("reaper batch size must be at least 1");
            }
        }
        if self.stats_refresh_secs == 0 {
            bail!("stats refresh interval must be greater than zero");
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

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn metrics_addr(&self) -> String {
        format!("{}:{}", self.host, self.metrics_port)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper.interval_secs)
    }

    pub fn reaper_lease(&self) -> Duration {
        Duration::from_secs(self.reaper.lease_duration_secs)
    }

    pub fn stats_refresh(&self) -> Duration {
        Duration::from_secs(self.stats_refresh_secs)
    }
}

#[derive(Parser, Debug, Default)]
#[command(name = "ff-api")]
#[command(about = "FlowForge submission API", long_about = None)]
pub struct ApiArgs {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "API_CONFIG")]
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

    #[arg(long, env = "API_HOST")]
    pub host: Option<String>,

    #[arg(long, env = "API_PORT")]
    pub port: Option<u16>,

    /// Port for the Prometheus /metrics listener
    #[arg(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Run the stale-claim reaper in this process
    #[arg(long, env = "REAPER_ENABLED")]
    pub reaper_enabled: Option<bool>,

    #[arg(long, env = "REAPER_INTERVAL", value_parser = parse_duration_secs)]
    pub reaper_interval: Option<u64>,

    #[arg(long, env = "REAPER_LEASE_DURATION", value_parser = parse_duration_secs)]
    pub reaper_lease_duration: Option<u64>,

    #[arg(long, env = "REAPER_BATCH_SIZE")]
    pub reaper_batch_size: Option<usize>,

    #[arg(long, env = "STATS_REFRESH_INTERVAL", value_parser = parse_duration_secs)]
    pub stats_refresh_interval: Option<u64>,

    #[arg(long, env = "WORKER_MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,

    #[arg(long, env = "WORKER_TIMEOUT_ACCOUNTING")]
    pub timeout_accounting: Option<TimeoutAccounting>,

    #[arg(long, env = "WORKER_MAX_TIMEOUTS")]
    pub max_timeouts: Option<u32>,

    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// pretty or json
    #[arg(long, env = "LOG_FORMAT")]
    pub log_format: Option<String>,
}

impl ApiArgs {
    pub fn into_config(self) -> anyhow::Result<ApiConfig> {
        let mut config = match &self.config {
            Some(path) => ApiConfig::from_file(path)?,
            None => ApiConfig::default(),
        };
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply(self, config: &mut ApiConfig) {
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
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(port) = self.metrics_port {
            config.metrics_port = port;
        }
        if let Some(enabled) = self.reaper_enabled {
            config.reaper.enabled = enabled;
        }
        if let Some(interval) = self.reaper_interval {
            config.reaper.interval_secs = interval;
        }
        if let Some(lease) = self.reaper_lease_duration {
            config.reaper.lease_duration_secs = lease;
        }
        if let Some(batch) = self.reaper_batch_size {
            config.reaper.batch_size = batch;
        }
        if let Some(refresh) = self.stats_refresh_interval {
            config.stats_refresh_secs = refresh;
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
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
    }
}
