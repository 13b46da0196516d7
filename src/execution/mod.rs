//! # Execution
//!
//! The [`BatchedMigrationRunner`] advances a single migration by one batch job (or runs it to
//! completion inline with `finalize`). The [`MigrationExecutor`] is the polling loop that
//! claims migrations from the store and hands them to the runner.

pub mod executor;
pub mod runner;

pub use executor::{ExecutionReport, ExecutorStats, MigrationExecutor};
pub use runner::{BatchedMigrationRunner, RunOutcome};
