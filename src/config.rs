//! Runtime configuration.
//!
//! Settings come from `LOCKQUEUE_*` environment variables with defaults
//! suitable for a single local worker, and can be overridden with builder
//! methods or CLI flags.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::scheduler::{QueueLengthLimit, WorkerConfig, WorkerPoolConfig};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration shared by the worker and the submission commands.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    // Store settings
    /// Redis connection URL.
    pub redis_url: String,
    /// Main list name and key prefix.
    pub queue_key: String,
    /// Job record time-to-live.
    pub jobs_ttl: Duration,

    // Worker settings
    pub polling_frequency: Duration,
    pub max_retries_per_job: u32,
    pub seconds_to_wait_before_retry: Duration,
    pub terminate_after_run: bool,
    /// Number of workers, used for the pool size and for estimates.
    pub workers: usize,

    // Admission settings
    /// Average resolution time per job.
    pub average_job_time: Duration,
    /// Queue limit multiplier per worker.
    pub max_queue_factor: usize,

    // Resolver settings
    /// Scratch root for per-job working directories.
    pub jobs_dir: PathBuf,
    /// Resolver executable, optionally with leading arguments.
    pub resolver_command: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            queue_key: "jobs-queue".to_string(),
            jobs_ttl: Duration::from_secs(600),
            polling_frequency: Duration::from_secs(5),
            max_retries_per_job: 3,
            seconds_to_wait_before_retry: Duration::from_secs(120),
            terminate_after_run: true,
            workers: 1,
            average_job_time: Duration::from_secs(30),
            max_queue_factor: 10,
            jobs_dir: std::env::temp_dir().join("lockqueue-jobs"),
            resolver_command: "composer".to_string(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `LOCKQUEUE_REDIS_URL`: Redis URL (default: redis://localhost:6379)
    /// - `LOCKQUEUE_QUEUE_KEY`: Main list name (default: jobs-queue)
    /// - `LOCKQUEUE_JOBS_TTL`: Record TTL in seconds (default: 600)
    /// - `LOCKQUEUE_POLLING_FREQUENCY`: Worker sleep in seconds (default: 5)
    /// - `LOCKQUEUE_MAX_RETRIES`: Claims per job (default: 3)
    /// - `LOCKQUEUE_RETRY_WAIT`: Seconds before a claim is stale (default: 120)
    /// - `LOCKQUEUE_TERMINATE_AFTER_RUN`: Stop after one job (default: true)
    /// - `LOCKQUEUE_WORKERS`: Worker count (default: 1)
    /// - `LOCKQUEUE_AVG_JOB_SECONDS`: Average job time (default: 30)
    /// - `LOCKQUEUE_MAX_QUEUE_FACTOR`: Queue limit per worker (default: 10)
    /// - `LOCKQUEUE_JOBS_DIR`: Scratch root (default: system temp dir)
    /// - `LOCKQUEUE_RESOLVER_COMMAND`: Resolver executable (default: composer)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// result fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup` instead of the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("LOCKQUEUE_REDIS_URL") {
            config.redis_url = val;
        }

        if let Some(val) = lookup("LOCKQUEUE_QUEUE_KEY") {
            config.queue_key = val;
        }

        if let Some(val) = lookup("LOCKQUEUE_JOBS_TTL") {
            config.jobs_ttl = parse_env_secs(&val, "LOCKQUEUE_JOBS_TTL")?;
        }

        if let Some(val) = lookup("LOCKQUEUE_POLLING_FREQUENCY") {
            config.polling_frequency = parse_env_secs(&val, "LOCKQUEUE_POLLING_FREQUENCY")?;
        }

        if let Some(val) = lookup("LOCKQUEUE_MAX_RETRIES") {
            config.max_retries_per_job = parse_env_value(&val, "LOCKQUEUE_MAX_RETRIES")?;
        }

        if let Some(val) = lookup("LOCKQUEUE_RETRY_WAIT") {
            config.seconds_to_wait_before_retry = parse_env_secs(&val, "LOCKQUEUE_RETRY_WAIT")?;
        }

        if let Some(val) = lookup("LOCKQUEUE_TERMINATE_AFTER_RUN") {
            config.terminate_after_run = parse_env_bool(&val, "LOCKQUEUE_TERMINATE_AFTER_RUN")?;
        }

        if let Some(val) = lookup("LOCKQUEUE_WORKERS") {
            config.workers = parse_env_value(&val, "LOCKQUEUE_WORKERS")?;
        }

        if let Some(val) = lookup("LOCKQUEUE_AVG_JOB_SECONDS") {
            config.average_job_time = parse_env_secs(&val, "LOCKQUEUE_AVG_JOB_SECONDS")?;
        }

        if let Some(val) = lookup("LOCKQUEUE_MAX_QUEUE_FACTOR") {
            config.max_queue_factor = parse_env_value(&val, "LOCKQUEUE_MAX_QUEUE_FACTOR")?;
        }

        if let Some(val) = lookup("LOCKQUEUE_JOBS_DIR") {
            config.jobs_dir = PathBuf::from(val);
        }

        if let Some(val) = lookup("LOCKQUEUE_RESOLVER_COMMAND") {
            config.resolver_command = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url must not be empty".to_string(),
            ));
        }

        if self.queue_key.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_key must not be empty".to_string(),
            ));
        }

        if self.jobs_ttl.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "jobs_ttl must be at least one second".to_string(),
            ));
        }

        if self.workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "workers must be at least 1".to_string(),
            ));
        }

        if self.max_queue_factor == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_queue_factor must be at least 1".to_string(),
            ));
        }

        if self.resolver_command.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "resolver_command must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Settings for each worker.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            polling_frequency: self.polling_frequency,
            max_retries_per_job: self.max_retries_per_job,
            seconds_to_wait_before_retry: self.seconds_to_wait_before_retry,
            terminate_after_run: self.terminate_after_run,
        }
    }

    /// Settings for an in-process pool of `workers` workers.
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.workers).with_worker_config(self.worker_config())
    }

    /// Admission limit for new submissions.
    pub fn queue_length_limit(&self) -> QueueLengthLimit {
        QueueLengthLimit::new(self.workers, self.max_queue_factor)
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_queue_key(mut self, key: impl Into<String>) -> Self {
        self.queue_key = key.into();
        self
    }

    pub fn with_jobs_ttl(mut self, ttl: Duration) -> Self {
        self.jobs_ttl = ttl;
        self
    }

    pub fn with_polling_frequency(mut self, frequency: Duration) -> Self {
        self.polling_frequency = frequency;
        self
    }

    pub fn with_max_retries_per_job(mut self, max: u32) -> Self {
        self.max_retries_per_job = max;
        self
    }

    pub fn with_seconds_to_wait_before_retry(mut self, wait: Duration) -> Self {
        self.seconds_to_wait_before_retry = wait;
        self
    }

    pub fn with_terminate_after_run(mut self, terminate: bool) -> Self {
        self.terminate_after_run = terminate;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_jobs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.jobs_dir = dir.into();
        self
    }

    pub fn with_resolver_command(mut self, command: impl Into<String>) -> Self {
        self.resolver_command = command.into();
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable holding whole seconds.
fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value(value, key).map(Duration::from_secs)
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
