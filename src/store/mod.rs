//! # Persistence
//!
//! [`MigrationStore`] is the seam between the engine and its storage. Everything the
//! engine needs to resume after a restart lives behind it: migrations, their batch jobs,
//! and the lease that keeps two executors off the same migration.
//!
//! Two implementations ship with the crate:
//!
//! - [`postgres::PgMigrationStore`] for production, using `FOR UPDATE SKIP LOCKED` to make
//!   selection safe across executor processes
//! - [`in_memory::InMemoryMigrationStore`] for tests and embedding

pub mod in_memory;
pub mod postgres;

use crate::error::Result;
use crate::models::{
    BatchedJob, BatchedMigration, MigrationConfiguration, NewBatchedJob, NewBatchedMigration,
};
use crate::state_machine::{JobStatus, MigrationStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

pub use in_memory::InMemoryMigrationStore;
pub use postgres::PgMigrationStore;

/// Filter for counting a migration's jobs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobCountQuery {
    /// Any of these statuses; empty means any status
    pub statuses: Vec<JobStatus>,
    pub except_status: Option<JobStatus>,
    pub created_since: Option<DateTime<Utc>>,
}

impl JobCountQuery {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses = vec![status];
        self
    }

    pub fn with_statuses(mut self, statuses: &[JobStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn except_status(mut self, status: JobStatus) -> Self {
        self.except_status = Some(status);
        self
    }

    pub fn created_since(mut self, since: DateTime<Utc>) -> Self {
        self.created_since = Some(since);
        self
    }

    pub fn matches(&self, job: &BatchedJob) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self.except_status != Some(job.status)
            && self.created_since.map_or(true, |since| job.created_at >= since)
    }
}

/// One page of a keyset walk over a migration's jobs in id order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobPage {
    pub status: JobStatus,
    /// Exclusive lower id bound
    pub after_id: i64,
    /// Inclusive upper id bound, fixed when the walk starts
    pub until_id: i64,
    pub limit: usize,
}

#[async_trait]
pub trait MigrationStore: Send + Sync {
    /// Insert a migration; the identity tuple must be unique
    async fn create_migration(
        &self,
        migration: NewBatchedMigration,
        now: DateTime<Utc>,
    ) -> Result<BatchedMigration>;

    async fn find_migration(&self, id: i64) -> Result<Option<BatchedMigration>>;

    async fn find_for_configuration(
        &self,
        configuration: &MigrationConfiguration,
    ) -> Result<Option<BatchedMigration>>;

    /// All migrations in queue order, optionally restricted to one schema
    async fn list_migrations(&self, schema: Option<&str>) -> Result<Vec<BatchedMigration>>;

    /// Active or paused migrations of `schema` in queue order
    async fn queued(&self, schema: &str) -> Result<Vec<BatchedMigration>>;

    /// Persist every mutable column of `migration`.
    ///
    /// A whole-row overwrite: concurrent status or hold changes are lost. Engine paths use
    /// the targeted updates below.
    async fn save_migration(&self, migration: &BatchedMigration) -> Result<()>;

    /// Write `status`, `started_at` and `failure_window_started_at` of `migration` only if
    /// the stored status is still `expected`. `false` when another writer got there first.
    async fn update_migration_status(
        &self,
        migration: &BatchedMigration,
        expected: MigrationStatus,
    ) -> Result<bool>;

    /// Write only the batch sizing columns
    async fn update_batch_sizes(
        &self,
        migration_id: i64,
        batch_size: i32,
        sub_batch_size: i32,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Write only `on_hold_until`
    async fn update_hold(
        &self,
        migration_id: i64,
        on_hold_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Oldest executable migration of `schema`, without taking a lease
    async fn active_migration(
        &self,
        schema: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchedMigration>>;

    /// Oldest executable migration of `schema` not leased by another executor, leased to
    /// `executor_id` until `now + lease`
    async fn claim_active_migration(
        &self,
        schema: &str,
        executor_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchedMigration>>;

    /// Drop the lease if `executor_id` holds it
    async fn release_migration(&self, migration_id: i64, executor_id: &str) -> Result<()>;

    /// Insert a pending job with zero attempts
    async fn create_job(&self, job: NewBatchedJob, now: DateTime<Utc>) -> Result<BatchedJob>;

    async fn find_job(&self, id: i64) -> Result<Option<BatchedJob>>;

    async fn save_job(&self, job: &BatchedJob) -> Result<()>;

    /// Job with the highest `max_value`
    async fn last_job(&self, migration_id: i64) -> Result<Option<BatchedJob>>;

    /// All jobs ordered by `min_value`
    async fn jobs_for_migration(&self, migration_id: i64) -> Result<Vec<BatchedJob>>;

    async fn jobs_with_status(&self, migration_id: i64, page: JobPage) -> Result<Vec<BatchedJob>>;

    /// First job that may run again: pending, failed with attempts left, or running but not
    /// updated since `stuck_before`
    async fn first_retriable_job(
        &self,
        migration_id: i64,
        max_attempts: i32,
        stuck_before: DateTime<Utc>,
    ) -> Result<Option<BatchedJob>>;

    async fn count_jobs(&self, migration_id: i64, query: JobCountQuery) -> Result<i64>;

    /// Most recently finished succeeded jobs, newest first
    async fn recent_successful_jobs(
        &self,
        migration_id: i64,
        limit: usize,
    ) -> Result<Vec<BatchedJob>>;

    /// Sum of `batch_size` over succeeded jobs per migration. Migrations without succeeded
    /// jobs are absent.
    async fn successful_rows_counts(&self, migration_ids: &[i64]) -> Result<HashMap<i64, i64>>;

    /// Highest job id of the migration, 0 without jobs
    async fn max_job_id(&self, migration_id: i64) -> Result<i64>;

    /// Atomically save the shrunk `job` and insert `sibling` as a failed job with zero
    /// attempts
    async fn split_job(
        &self,
        job: &BatchedJob,
        sibling: NewBatchedJob,
        now: DateTime<Utc>,
    ) -> Result<BatchedJob>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::batched_job::test_support::job;

    #[test]
    fn test_job_count_query_matches() {
        let now = Utc::now();
        let mut failed = job(1, 1, 1, 10);
        failed.status = JobStatus::Failed;
        failed.created_at = now;

        assert!(JobCountQuery::default().matches(&failed));
        assert!(JobCountQuery::default()
            .with_status(JobStatus::Failed)
            .matches(&failed));
        assert!(!JobCountQuery::default()
            .except_status(JobStatus::Failed)
            .matches(&failed));
        assert!(JobCountQuery::default()
            .with_statuses(&[JobStatus::Failed, JobStatus::BlockedByMaxAttempts])
            .created_since(now - Duration::minutes(1))
            .matches(&failed));
        assert!(!JobCountQuery::default()
            .created_since(now + Duration::minutes(1))
            .matches(&failed));
    }
}
