//! # System Constants
//!
//! Defaults shared by the migration model, the failure monitor, the optimizer and the
//! executor. Every value here can be overridden through [`crate::config::EngineConfig`];
//! these are the values used when nothing is configured.

/// Failure monitor thresholds
pub mod failure_monitor {
    /// Jobs that must exist in the sampling window before the ratio is judged
    pub const MINIMUM_JOBS: i64 = 50;

    /// Stop when `failed / total` is strictly greater than this
    pub const MAXIMUM_FAILED_RATIO: f64 = 0.5;
}

/// Batch optimizer tuning
pub mod optimizer {
    /// Successful jobs sampled by the smoothed efficiency
    pub const NUMBER_OF_JOBS: usize = 20;

    /// Exponential smoothing factor
    pub const EMA_ALPHA: f64 = 0.4;

    /// Efficiency band in which the batch size is left alone
    pub const TARGET_EFFICIENCY_MIN: f64 = 0.9;
    pub const TARGET_EFFICIENCY_MAX: f64 = 0.95;

    /// Cap on a single growth step
    pub const MAX_MULTIPLIER: f64 = 1.2;

    pub const MIN_BATCH_SIZE: i32 = 1_000;
    pub const MAX_BATCH_SIZE: i32 = 2_000_000;

    /// Decimal places kept by the smoothed efficiency
    pub const EFFICIENCY_PRECISION: i32 = 2;
}

/// Batch job retry policy
pub mod retry {
    /// Attempts after which a failing job is blocked
    pub const MAX_ATTEMPTS: i32 = 3;

    /// Page size used when walking job sets in bounded sub-batches
    pub const EACH_BATCH_SIZE: usize = 100;

    /// Running jobs not updated for this long are considered abandoned
    pub const STUCK_JOB_TIMEOUT_SECONDS: i64 = 3_600;
}

/// Defaults for newly queued migrations
pub mod migration {
    pub const DEFAULT_SCHEMA: &str = "main";
    pub const DEFAULT_BATCH_SIZE: i32 = 1_000;
    pub const DEFAULT_SUB_BATCH_SIZE: i32 = 100;
    pub const DEFAULT_INTERVAL_SECONDS: i64 = 120;
    pub const DEFAULT_PAUSE_MS: i32 = 100;

    /// `hold!` without an explicit end time
    pub const DEFAULT_HOLD_SECONDS: i64 = 600;
}

/// Executor loop defaults
pub mod executor {
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
    pub const DEFAULT_LEASE_SECONDS: i64 = 300;
}
