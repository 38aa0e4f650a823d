//! Configuration management.

use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Job broker configuration
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Scheduled task configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Backup engine configuration
    #[serde(default)]
    pub backup: BackupConfig,

    /// Bulk mail delivery configuration
    #[serde(default)]
    pub mailer: MailerConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Redis connection URL
    #[serde(default = "default_broker_url")]
    pub url: String,

    /// Bounded timeout for the initial connection attempt (seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Maximum concurrent job executions in durable mode
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Interval between reconnection probes after the broker drops (seconds)
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,

    /// Key prefix for all broker state
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            connect_timeout_secs: default_connect_timeout(),
            worker_concurrency: default_worker_concurrency(),
            reconnect_interval_secs: default_reconnect_interval(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// Cron expressions use the six-field `sec min hour dom mon dow` syntax of
/// the `cron` crate.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// IANA timezone used to evaluate cron expressions
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Daily reminder schedule (default: 09:00 every day)
    #[serde(default = "default_daily_reminder_cron")]
    pub daily_reminder_cron: String,

    /// Weekly summary schedule (default: 08:00 on Sundays)
    #[serde(default = "default_weekly_summary_cron")]
    pub weekly_summary_cron: String,

    /// Queue health check schedule (default: on the hour)
    #[serde(default = "default_health_check_cron")]
    pub health_check_cron: String,

    /// Job history cleanup schedule (default: midnight)
    #[serde(default = "default_cleanup_cron")]
    pub cleanup_cron: String,

    /// Nightly database backup schedule (default: 23:30)
    #[serde(default = "default_backup_cron")]
    pub backup_cron: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            daily_reminder_cron: default_daily_reminder_cron(),
            weekly_summary_cron: default_weekly_summary_cron(),
            health_check_cron: default_health_check_cron(),
            cleanup_cron: default_cleanup_cron(),
            backup_cron: default_backup_cron(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    /// Directory backup artifacts are written to
    #[serde(default = "default_backup_dir")]
    pub dir: String,

    /// Age threshold beyond which artifacts are deleted by cleanup (days)
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: default_backup_dir(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailerConfig {
    /// Emails sent per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Delay between batches to respect downstream rate limits (milliseconds)
    #[serde(default = "default_batch_delay")]
    pub batch_delay_ms: u64,
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_broker_url() -> String { "redis://127.0.0.1:6379".to_string() }
fn default_connect_timeout() -> u64 { 3 }
fn default_worker_concurrency() -> usize { 5 }
fn default_reconnect_interval() -> u64 { 10 }
fn default_key_prefix() -> String { "jobforge".to_string() }
fn default_timezone() -> String { "UTC".to_string() }
fn default_daily_reminder_cron() -> String { "0 0 9 * * *".to_string() }
fn default_weekly_summary_cron() -> String { "0 0 8 * * SUN".to_string() }
fn default_health_check_cron() -> String { "0 0 * * * *".to_string() }
fn default_cleanup_cron() -> String { "0 0 0 * * *".to_string() }
fn default_backup_cron() -> String { "0 30 23 * * *".to_string() }
fn default_backup_dir() -> String { "./backups".to_string() }
fn default_retention_days() -> i64 { 7 }
fn default_batch_size() -> usize { 10 }
fn default_batch_delay() -> u64 { 2000 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("JOBFORGE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("JOBFORGE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}
