//! # Engine Configuration
//!
//! Typed configuration for the migration engine. Every section has defaults matching
//! [`crate::constants`], so an empty configuration is valid.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use batched_migrations::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Reads config/base.toml, config/<env>.toml and BATCHED_MIGRATIONS__* variables
//! let manager = ConfigManager::load()?;
//!
//! let poll_interval = manager.config().executor.poll_interval();
//! let minimum_jobs = manager.config().failure_monitor.minimum_jobs;
//! # Ok(())
//! # }
//! ```

pub mod loader;

use crate::constants;
use crate::error::{MigrationError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use loader::ConfigManager;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub executor: ExecutorConfig,
    pub failure_monitor: FailureMonitorConfig,
    pub optimizer: OptimizerConfig,
    pub retry: RetryConfig,
    pub hold: HoldConfig,
}

impl EngineConfig {
    /// Reject values that would make the control loops misbehave
    pub fn validate(&self) -> Result<()> {
        self.failure_monitor.validate()?;
        self.optimizer.validate()?;
        self.retry.validate()?;

        if self.executor.poll_interval_ms == 0 {
            return Err(MigrationError::ConfigurationError(
                "executor.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.executor.lease_seconds <= 0 {
            return Err(MigrationError::ConfigurationError(
                "executor.lease_seconds must be greater than zero".to_string(),
            ));
        }
        if self.hold.default_hold_seconds <= 0 {
            return Err(MigrationError::ConfigurationError(
                "hold.default_hold_seconds must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/batched_migrations_development".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Connection scope whose migrations this executor drives
    pub schema: String,
    pub poll_interval_ms: u64,
    /// Slack subtracted from a migration's interval to absorb scheduler jitter
    pub interval_variance_ms: u64,
    /// How long a claimed migration stays exclusive to one executor
    pub lease_seconds: i64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            schema: constants::migration::DEFAULT_SCHEMA.to_string(),
            poll_interval_ms: constants::executor::DEFAULT_POLL_INTERVAL_MS,
            interval_variance_ms: 0,
            lease_seconds: constants::executor::DEFAULT_LEASE_SECONDS,
        }
    }
}

impl ExecutorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn interval_variance(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.interval_variance_ms as i64)
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_seconds)
    }
}

/// Which failures the circuit breaker counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureWindowPolicy {
    /// Count every job since the migration first became active
    #[default]
    Cumulative,
    /// Restart the sampling window whenever failed jobs are retried
    ResetOnRetry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureMonitorConfig {
    pub minimum_jobs: i64,
    pub maximum_failed_ratio: f64,
    pub window: FailureWindowPolicy,
}

impl Default for FailureMonitorConfig {
    fn default() -> Self {
        Self {
            minimum_jobs: constants::failure_monitor::MINIMUM_JOBS,
            maximum_failed_ratio: constants::failure_monitor::MAXIMUM_FAILED_RATIO,
            window: FailureWindowPolicy::default(),
        }
    }
}

impl FailureMonitorConfig {
    fn validate(&self) -> Result<()> {
        if self.minimum_jobs < 1 {
            return Err(MigrationError::ConfigurationError(
                "failure_monitor.minimum_jobs must be at least 1".to_string(),
            ));
        }
        if !(self.maximum_failed_ratio > 0.0 && self.maximum_failed_ratio <= 1.0) {
            return Err(MigrationError::ConfigurationError(format!(
                "failure_monitor.maximum_failed_ratio must be in (0, 1], got {}",
                self.maximum_failed_ratio
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub enabled: bool,
    pub number_of_jobs: usize,
    pub alpha: f64,
    pub target_efficiency_min: f64,
    pub target_efficiency_max: f64,
    pub max_multiplier: f64,
    pub min_batch_size: i32,
    pub max_batch_size: i32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            number_of_jobs: constants::optimizer::NUMBER_OF_JOBS,
            alpha: constants::optimizer::EMA_ALPHA,
            target_efficiency_min: constants::optimizer::TARGET_EFFICIENCY_MIN,
            target_efficiency_max: constants::optimizer::TARGET_EFFICIENCY_MAX,
            max_multiplier: constants::optimizer::MAX_MULTIPLIER,
            min_batch_size: constants::optimizer::MIN_BATCH_SIZE,
            max_batch_size: constants::optimizer::MAX_BATCH_SIZE,
        }
    }
}

impl OptimizerConfig {
    fn validate(&self) -> Result<()> {
        if self.number_of_jobs == 0 {
            return Err(MigrationError::ConfigurationError(
                "optimizer.number_of_jobs must be at least 1".to_string(),
            ));
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(MigrationError::ConfigurationError(format!(
                "optimizer.alpha must be in (0, 1), got {}",
                self.alpha
            )));
        }
        if self.target_efficiency_min > self.target_efficiency_max {
            return Err(MigrationError::ConfigurationError(format!(
                "optimizer target efficiency range is inverted: {} > {}",
                self.target_efficiency_min, self.target_efficiency_max
            )));
        }
        if self.max_multiplier <= 1.0 {
            return Err(MigrationError::ConfigurationError(
                "optimizer.max_multiplier must be greater than 1".to_string(),
            ));
        }
        if self.min_batch_size < 1 || self.min_batch_size > self.max_batch_size {
            return Err(MigrationError::ConfigurationError(format!(
                "optimizer batch size bounds are invalid: [{}, {}]",
                self.min_batch_size, self.max_batch_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: i32,
    /// Page size for bounded passes over failed or blocked jobs
    pub sub_batch_size: usize,
    /// A running job untouched for this long is treated as abandoned and retried
    pub stuck_job_timeout_seconds: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: constants::retry::MAX_ATTEMPTS,
            sub_batch_size: constants::retry::EACH_BATCH_SIZE,
            stuck_job_timeout_seconds: constants::retry::STUCK_JOB_TIMEOUT_SECONDS,
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(MigrationError::ConfigurationError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.sub_batch_size == 0 {
            return Err(MigrationError::ConfigurationError(
                "retry.sub_batch_size must be at least 1".to_string(),
            ));
        }
        if self.stuck_job_timeout_seconds <= 0 {
            return Err(MigrationError::ConfigurationError(
                "retry.stuck_job_timeout_seconds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn stuck_job_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stuck_job_timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HoldConfig {
    pub default_hold_seconds: i64,
}

impl Default for HoldConfig {
    fn default() -> Self {
        Self {
            default_hold_seconds: constants::migration::DEFAULT_HOLD_SECONDS,
        }
    }
}

impl HoldConfig {
    pub fn default_hold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.default_hold_seconds)
    }
}
