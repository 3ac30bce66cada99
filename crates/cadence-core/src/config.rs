use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CadenceError, Result};

pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 60;
/// Ten years; larger delays overflow timestamp arithmetic.
pub const MAX_RETRY_DELAY_SECS: u64 = 10 * 365 * 24 * 60 * 60;
pub const DEFAULT_MAX_EXECUTION_ATTEMPTS: u32 = 3;
pub const DEFAULT_MIN_THREADS: usize = 1;
pub const DEFAULT_MAX_THREADS: usize = 4;
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Jobs created at startup when no job with the same ID exists yet.
    #[serde(default)]
    pub jobs: Vec<SeedJobConfig>,
}

/// Scheduler identity and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Name written into `lock_name` when this instance claims a job.
    /// Must be stable across restarts so the startup lock-reset sweep
    /// finds rows left locked by a crash.
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    /// Seconds between dispatch ticks.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Minimum seconds between two attempts of the same failing job.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Attempts after which a failing job moves to FAILED.
    #[serde(default = "default_max_execution_attempts")]
    pub max_execution_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            max_execution_attempts: DEFAULT_MAX_EXECUTION_ATTEMPTS,
        }
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_min_threads")]
    pub min_threads: usize,
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    /// Jobs waiting for a worker before the dispatch loop backs off.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Idle seconds before a worker above `min_threads` retires.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            min_threads: DEFAULT_MIN_THREADS,
            max_threads: DEFAULT_MAX_THREADS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a connection waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// A job declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedJobConfig {
    pub id: String,
    pub name: String,
    pub scheduling_pattern: String,
    pub job_class: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub once_off: bool,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

fn bool_true() -> bool {
    true
}
fn default_instance_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
fn default_tick_interval_secs() -> u64 {
    DEFAULT_TICK_INTERVAL_SECS
}
fn default_retry_delay_secs() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}
fn default_max_execution_attempts() -> u32 {
    DEFAULT_MAX_EXECUTION_ATTEMPTS
}
fn default_min_threads() -> usize {
    DEFAULT_MIN_THREADS
}
fn default_max_threads() -> usize {
    DEFAULT_MAX_THREADS
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_keep_alive_secs() -> u64 {
    DEFAULT_KEEP_ALIVE_SECS
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.cadence/cadence.toml
    ///
    /// A missing file is not an error; defaults fill every field.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract::<CadenceConfig>()
            .map_err(|e| CadenceError::Config(e.to_string()))?
            .validated()
    }

    /// Like [`load`](Self::load), but an unreadable or malformed config falls
    /// back to defaults. Settings that parse but fail validation are still an
    /// error.
    pub fn load_or_default(config_path: Option<&str>) -> Result<Self> {
        match Self::load(config_path) {
            Err(e @ CadenceError::Config(_)) => {
                warn!(code = e.code(), "Config load failed ({}), using defaults", e);
                Ok(Self::default())
            }
            other => other,
        }
    }

    fn figment(path: &str) -> Figment {
        Figment::from(Serialized::defaults(CadenceConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("CADENCE_").split("__"))
    }

    /// Reject settings the executor cannot run with.
    pub fn validated(self) -> Result<Self> {
        use CadenceError::InvalidConfig;

        if self.scheduler.instance_name.trim().is_empty() {
            return Err(InvalidConfig("scheduler.instance_name must not be empty".into()));
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err(InvalidConfig("scheduler.tick_interval_secs must be positive".into()));
        }
        if self.scheduler.retry_delay_secs > MAX_RETRY_DELAY_SECS {
            return Err(InvalidConfig(format!(
                "scheduler.retry_delay_secs must be at most {MAX_RETRY_DELAY_SECS}"
            )));
        }
        if self.scheduler.max_execution_attempts == 0 {
            return Err(InvalidConfig("scheduler.max_execution_attempts must be positive".into()));
        }
        if self.executor.max_threads == 0 || self.executor.min_threads > self.executor.max_threads {
            return Err(InvalidConfig(format!(
                "executor threads must satisfy 0 <= min ({}) <= max ({}), max > 0",
                self.executor.min_threads, self.executor.max_threads
            )));
        }
        if self.executor.queue_capacity == 0 {
            return Err(InvalidConfig("executor.queue_capacity must be positive".into()));
        }
        Ok(self)
    }
}

impl DatabaseConfig {
    /// Create the directory holding the database file if it is missing.
    pub fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = std::path::Path::new(&self.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = CadenceConfig::load(Some("does-not-exist.toml")).unwrap();
            assert_eq!(config.scheduler.tick_interval_secs, DEFAULT_TICK_INTERVAL_SECS);
            assert_eq!(config.executor.queue_capacity, DEFAULT_QUEUE_CAPACITY);
            assert!(config.jobs.is_empty());
            Ok(())
        });
    }

    #[test]
    fn toml_file_and_env_overrides() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "cadence.toml",
                r#"
                [scheduler]
                instance_name = "node-a"
                max_execution_attempts = 5

                [executor]
                max_threads = 8

                [[jobs]]
                id = "nightly-report"
                name = "Nightly report"
                scheduling_pattern = "0 2 * * *"
                job_class = "cadence.log"
                parameters = { message = "report" }
                "#,
            )?;
            jail.set_env("CADENCE_SCHEDULER__RETRY_DELAY_SECS", "300");

            let config = CadenceConfig::load(Some("cadence.toml")).unwrap();
            assert_eq!(config.scheduler.instance_name, "node-a");
            assert_eq!(config.scheduler.max_execution_attempts, 5);
            assert_eq!(config.scheduler.retry_delay_secs, 300);
            assert_eq!(config.executor.max_threads, 8);
            assert_eq!(config.executor.min_threads, DEFAULT_MIN_THREADS);
            assert_eq!(config.jobs.len(), 1);
            assert!(config.jobs[0].enabled);
            assert_eq!(config.jobs[0].parameters["message"], "report");
            Ok(())
        });
    }

    #[test]
    fn inverted_thread_bounds_are_rejected() {
        let mut config = CadenceConfig::default();
        config.executor.min_threads = 5;
        config.executor.max_threads = 2;
        assert!(matches!(
            config.validated(),
            Err(CadenceError::InvalidConfig(_))
        ));
    }

    #[test]
    fn oversized_retry_delay_is_rejected() {
        let mut config = CadenceConfig::default();
        config.scheduler.retry_delay_secs = MAX_RETRY_DELAY_SECS;
        assert!(config.clone().validated().is_ok());
        config.scheduler.retry_delay_secs = u64::MAX / 2;
        assert!(config.validated().is_err());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("cadence.toml", "[scheduler\ninstance_name = ")?;
            assert!(matches!(
                CadenceConfig::load(Some("cadence.toml")),
                Err(CadenceError::Config(_))
            ));
            let config = CadenceConfig::load_or_default(Some("cadence.toml")).unwrap();
            assert_eq!(config.scheduler.tick_interval_secs, DEFAULT_TICK_INTERVAL_SECS);
            Ok(())
        });
    }

    #[test]
    fn invalid_settings_are_not_replaced_by_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "cadence.toml",
                r#"
                [executor]
                min_threads = 8
                max_threads = 2
                "#,
            )?;
            let err = CadenceConfig::load_or_default(Some("cadence.toml")).unwrap_err();
            assert_eq!(err.code(), "INVALID_CONFIG");

            jail.create_file("cadence.toml", "[scheduler]\ntick_interval_secs = 0\n")?;
            assert!(CadenceConfig::load_or_default(Some("cadence.toml")).is_err());
            Ok(())
        });
    }

    #[test]
    fn ensure_parent_dir_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseConfig {
            path: dir.path().join("a/b/cadence.db").display().to_string(),
            ..DatabaseConfig::default()
        };
        db.ensure_parent_dir().unwrap();
        assert!(dir.path().join("a/b").is_dir());
    }

    #[test]
    fn ensure_parent_dir_reports_io_errors() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let db = DatabaseConfig {
            path: blocker.join("cadence.db").display().to_string(),
            ..DatabaseConfig::default()
        };
        let err = db.ensure_parent_dir().unwrap_err();
        assert!(matches!(err, CadenceError::Io(_)));
        assert_eq!(err.code(), "IO_ERROR");
    }
}
