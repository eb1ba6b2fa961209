use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::collections::EvictionPolicy;
use crate::coordination::{DegradationDetectorConfig, LockManagerConfig, RetryPolicy};
use crate::persistence::transaction_queue::TransactionQueueConfig;
use crate::services::ProberConfig;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub detector: DegradationDetectorConfig,
    #[serde(default)]
    pub prober: ProberConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    /// Backoff shared by lease renewal and per-item recovery retries
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub dedupe: DedupeConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Seconds between queue status log lines while degraded (default: 30)
    #[serde(default = "default_status_log_interval_secs")]
    pub status_log_interval_secs: u64,
}

fn default_status_log_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL for the roster datastore
    #[serde(default)]
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// SQLite file backing the transaction queue
    #[serde(default = "default_queue_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Pending size above which admission logs a warning
    #[serde(default = "default_capacity_warning")]
    pub capacity_warning: usize,
    /// Age after which a processing claim is reclaimed
    #[serde(default = "default_processing_timeout_secs")]
    pub processing_timeout_secs: u64,
    /// How long completed/failed records are kept before purge
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("data/rosterd-queue.db")
}

fn default_max_retries() -> u32 {
    crate::domain::DEFAULT_MAX_RETRIES
}

fn default_capacity_warning() -> usize {
    1000
}

fn default_processing_timeout_secs() -> u64 {
    300
}

fn default_retention_hours() -> u64 {
    72
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: default_queue_path(),
            max_retries: default_max_retries(),
            capacity_warning: default_capacity_warning(),
            processing_timeout_secs: default_processing_timeout_secs(),
            retention_hours: default_retention_hours(),
        }
    }
}

impl QueueConfig {
    pub fn queue_config(&self) -> TransactionQueueConfig {
        TransactionQueueConfig {
            max_retries: self.max_retries,
            capacity_warning: self.capacity_warning,
            processing_timeout: chrono::Duration::seconds(self.processing_timeout_secs as i64),
        }
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours as i64)
    }
}

/// Where the authority lease lives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseBackend {
    /// Shared PostgreSQL table, visible to every instance
    #[default]
    Postgres,
    /// Local SQLite file; single-host deployments only
    Sqlite,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeaseConfig {
    #[serde(flatten)]
    pub manager: LockManagerConfig,
    #[serde(default)]
    pub backend: LeaseBackend,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupeConfig {
    #[serde(default = "default_dedupe_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_dedupe_max_entries")]
    pub max_entries: usize,
}

fn default_dedupe_ttl_secs() -> u64 {
    600
}

fn default_dedupe_max_entries() -> usize {
    1000
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_dedupe_ttl_secs(),
            max_entries: default_dedupe_max_entries(),
        }
    }
}

impl DedupeConfig {
    pub fn policy(&self) -> EvictionPolicy {
        EvictionPolicy::new(Duration::from_secs(self.ttl_secs), self.max_entries)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    /// Dashboard server port (default: 8080)
    #[serde(default = "default_dashboard_port")]
    pub port: u16,
}

fn default_dashboard_port() -> u16 {
    8080
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            port: default_dashboard_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("ROSTERD_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (ROSTERD__LEASE__DURATION_SECS, etc.)
            .add_source(
                Environment::with_prefix("ROSTERD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    pub fn status_log_interval(&self) -> Duration {
        Duration::from_secs(self.status_log_interval_secs)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.database.url.trim().is_empty() {
            errors.push("database.url is required".to_string());
        }

        if self.detector.failure_threshold == 0 {
            errors.push("detector.failure_threshold must be at least 1".to_string());
        }
        if self.detector.success_threshold == 0 {
            errors.push("detector.success_threshold must be at least 1".to_string());
        }

        if self.prober.interval_secs == 0 {
            errors.push("prober.interval_secs must be positive".to_string());
        }

        let lease = &self.lease.manager;
        if lease.renewal_interval_secs == 0 {
            errors.push("lease.renewal_interval_secs must be positive".to_string());
        }
        if lease.duration_secs <= 2 * lease.renewal_interval_secs {
            errors.push(format!(
                "lease.duration_secs ({}) must exceed twice lease.renewal_interval_secs ({})",
                lease.duration_secs, lease.renewal_interval_secs
            ));
        }

        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.multiplier < 1.0 {
            errors.push("retry.multiplier must be at least 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            errors.push("retry.jitter must be between 0 and 1".to_string());
        }

        if self.queue.max_retries == 0 {
            errors.push("queue.max_retries must be at least 1".to_string());
        }
        if self.dedupe.max_entries == 0 {
            errors.push("dedupe.max_entries must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(dir.path()).unwrap();

        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.detector.failure_threshold, 3);
        assert_eq!(config.detector.success_threshold, 2);
        assert_eq!(config.lease.manager.resource, "bot_authority");
        assert_eq!(config.lease.manager.duration_secs, 120);
        assert_eq!(config.lease.backend, LeaseBackend::Postgres);
        assert_eq!(config.prober.timeout_ms, 3000);
        assert_eq!(config.dashboard.port, 8080);
        assert_eq!(config.status_log_interval_secs, 30);
    }

    #[test]
    fn test_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            r#"
            [database]
            url = "postgres://localhost/roster"

            [lease]
            backend = "sqlite"
            duration_secs = 60
            renewal_interval_secs = 10

            [retry]
            base_delay_ms = 250
            "#,
        )
        .unwrap();

        let config = AppConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.lease.backend, LeaseBackend::Sqlite);
        assert_eq!(config.lease.manager.duration_secs, 60);
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::load_from(dir.path()).unwrap();
        config.database.url = "postgres://localhost/roster".to_string();
        assert!(config.validate().is_ok());

        config.detector.failure_threshold = 0;
        config.lease.manager.duration_secs = 60;
        config.retry.jitter = 1.5;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("failure_threshold")));
        assert!(errors.iter().any(|e| e.contains("lease.duration_secs")));
        assert!(errors.iter().any(|e| e.contains("jitter")));
    }
}
