//! # Resilience Module
//!
//! Circuit breaking for migrations whose batches keep failing. The monitor is consulted
//! after every failed batch; when it trips, the runner drives the migration's `failure`
//! transition and operators take over through the administrative surface.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use batched_migrations::resilience::{FailureMonitor, FailureSample};
//!
//! let monitor = FailureMonitor::default();
//!
//! // 26 of 50 jobs failed: more than half, with enough samples to judge
//! assert!(monitor.should_stop_for(FailureSample { total_jobs: 50, failed_jobs: 26 }));
//! ```

pub mod failure_monitor;

pub use failure_monitor::{FailureMonitor, FailureSample};
