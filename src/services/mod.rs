//! # Services
//!
//! Operations that span several models: retrying failed batch jobs and the administrative
//! surface operators use to inspect and steer migrations.

pub mod migration_admin;
pub mod retry_service;

pub use migration_admin::{JobCounts, MigrationAdmin, MigrationStatusReport};
pub use retry_service::{RetryService, RetrySummary, SplitOutcome};
