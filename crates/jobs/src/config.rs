//! Scheduler configuration.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::types::DEFAULT_MAX_ATTEMPTS;

/// Per-attempt execution cap for engine calls.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub const ENV_MAX_WORKERS: &str = "CSVFORGE_MAX_WORKERS";
pub const ENV_MAX_ATTEMPTS: &str = "CSVFORGE_MAX_ATTEMPTS";
pub const ENV_ATTEMPT_TIMEOUT_SECS: &str = "CSVFORGE_ATTEMPT_TIMEOUT_SECS";
pub const ENV_STORE_PATH: &str = "CSVFORGE_STORE_PATH";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}: expected a positive integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of worker threads (concurrent jobs)
    pub max_workers: usize,
    /// Refinement budget for training jobs
    pub max_attempts: u32,
    /// Cap on a single engine call
    pub attempt_timeout: Duration,
    /// Snapshot file of the durable job store
    pub store_path: PathBuf,
    /// Name for logging and worker threads
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            store_path: PathBuf::from("temp/jobs.json"),
            name: "csvforge".to_string(),
        }
    }
}

/// Two workers per available core, kept within 4..=32.
pub fn default_max_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus * 2).clamp(4, 32)
}

impl SchedulerConfig {
    /// Defaults overlaid with `CSVFORGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`SchedulerConfig::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(n) = parse_positive(&lookup, ENV_MAX_WORKERS)? {
            config.max_workers = n as usize;
        }
        if let Some(n) = parse_positive(&lookup, ENV_MAX_ATTEMPTS)? {
            config.max_attempts = n.min(u64::from(u32::MAX)) as u32;
        }
        if let Some(n) = parse_positive(&lookup, ENV_ATTEMPT_TIMEOUT_SECS)? {
            config.attempt_timeout = Duration::from_secs(n);
        }
        if let Some(path) = lookup(ENV_STORE_PATH).filter(|p| !p.trim().is_empty()) {
            config.store_path = PathBuf::from(path);
        }
        Ok(config)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max.max(1);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = path.into();
        self
    }
}

fn parse_positive<F>(lookup: &F, var: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(Some(n)),
        _ => {
            warn!(var, value = %raw, "invalid configuration value");
            Err(ConfigError::InvalidNumber { var, value: raw })
        }
    }
}
