pub mod loader;

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::logging::LogFormat;
use crate::queue::RetryPolicy;
use crate::roots::RootsConfig;

pub use loader::{parse_bool, parse_list};

/// Runtime configuration for the daemon and its services.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Explicit database location; `None` uses the default under the home directory.
    pub database_path: Option<PathBuf>,
    pub roots: RootsConfig,
    pub watcher: WatcherSettings,
    pub jobs: JobSettings,
    pub dedup: DedupSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub enabled: bool,
    /// Root keys to watch; `None` watches every configured root.
    pub root_keys: Option<Vec<String>>,
    pub poll_interval: Duration,
    pub stability_window: Duration,
    pub exclude: Vec<String>,
    pub auto_organize: bool,
    pub backfill_missing_outputs: bool,
    /// Scans between cleanup passes; 0 disables cleanup.
    pub cleanup_every_scans: u32,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            root_keys: None,
            poll_interval: Duration::from_millis(5_000),
            stability_window: Duration::from_millis(30_000),
            exclude: Vec::new(),
            auto_organize: false,
            backfill_missing_outputs: true,
            cleanup_every_scans: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    Fixed,
    #[default]
    Exponential,
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Base retry delay; zero retries immediately.
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
    pub retry_strategy: BackoffStrategy,
    pub cleanup_days: u32,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval: Duration::from_millis(5_000),
            retry_backoff: Duration::ZERO,
            retry_backoff_max: Duration::from_millis(300_000),
            retry_strategy: BackoffStrategy::default(),
            cleanup_days: 7,
        }
    }
}

impl JobSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        if self.retry_backoff.is_zero() {
            return RetryPolicy::Immediate;
        }
        match self.retry_strategy {
            BackoffStrategy::Fixed => RetryPolicy::Fixed(self.retry_backoff),
            BackoffStrategy::Exponential => RetryPolicy::Exponential {
                base: self.retry_backoff,
                max: self.retry_backoff_max.max(self.retry_backoff),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct DedupSettings {
    pub batch_limit: usize,
    pub sample_bytes: u64,
    /// Delay between scheduled hashing batches; zero disables scheduling.
    pub interval: Duration,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            batch_limit: 50,
            sample_bytes: 64 * 1024,
            interval: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Config {
    /// Reads configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        loader::load(&lookup)
    }

    /// Returns the configured database path or the default location.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => crate::db::default_database_path().ok_or(ConfigError::MissingDatabasePath),
        }
    }

    /// Root keys the daemon should start watchers for.
    pub fn watch_root_keys(&self, configured: &[String]) -> Vec<String> {
        match &self.watcher.root_keys {
            Some(keys) => keys.clone(),
            None => configured.to_vec(),
        }
    }
}

/// Default scheduler concurrency: available CPUs, at most four.
pub fn default_concurrency() -> usize {
    num_cpus::get().clamp(1, 4)
}
