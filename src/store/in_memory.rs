use super::{JobCountQuery, JobPage, MigrationStore};
use crate::error::{MigrationError, Result};
use crate::models::{
    BatchedJob, BatchedMigration, MigrationConfiguration, NewBatchedJob, NewBatchedMigration,
};
use crate::state_machine::{JobStatus, MigrationStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone)]
struct StoredMigration {
    migration: BatchedMigration,
    locked_by: Option<String>,
    locked_until: Option<DateTime<Utc>>,
}

impl StoredMigration {
    fn lease_available(&self, executor_id: &str, now: DateTime<Utc>) -> bool {
        match (&self.locked_by, self.locked_until) {
            (Some(holder), Some(until)) => holder == executor_id || until <= now,
            _ => true,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    migrations: BTreeMap<i64, StoredMigration>,
    jobs: BTreeMap<i64, BatchedJob>,
    next_migration_id: i64,
    next_job_id: i64,
}

impl Inner {
    fn insert_job(&mut self, job: NewBatchedJob, status: JobStatus, now: DateTime<Utc>) -> BatchedJob {
        self.next_job_id += 1;
        let job = BatchedJob {
            id: self.next_job_id,
            batched_migration_id: job.batched_migration_id,
            min_value: job.min_value,
            max_value: job.max_value,
            batch_size: job.batch_size,
            sub_batch_size: job.sub_batch_size,
            pause_ms: job.pause_ms,
            status,
            attempts: 0,
            last_error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        };
        self.jobs.insert(job.id, job.clone());
        job
    }

    fn jobs_of(&self, migration_id: i64) -> impl Iterator<Item = &BatchedJob> {
        self.jobs
            .values()
            .filter(move |job| job.batched_migration_id == migration_id)
    }

    fn executable(&self, schema: &str, now: DateTime<Utc>) -> impl Iterator<Item = &StoredMigration> {
        let schema = schema.to_string();
        self.migrations.values().filter(move |stored| {
            stored.migration.schema_name == schema && stored.migration.is_executable(now)
        })
    }
}

/// Process-local store for tests and embedding
#[derive(Debug, Default)]
pub struct InMemoryMigrationStore {
    inner: RwLock<Inner>,
}

impl InMemoryMigrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current lease holder of a migration
    pub fn lease_holder(&self, migration_id: i64) -> Option<String> {
        self.inner
            .read()
            .migrations
            .get(&migration_id)
            .and_then(|stored| stored.locked_by.clone())
    }
}

#[async_trait]
impl MigrationStore for InMemoryMigrationStore {
    async fn create_migration(
        &self,
        new_migration: NewBatchedMigration,
        now: DateTime<Utc>,
    ) -> Result<BatchedMigration> {
        new_migration.validate()?;
        let mut inner = self.inner.write();

        let duplicate = inner.migrations.values().any(|stored| {
            let existing = &stored.migration;
            existing.job_class_name == new_migration.job_class_name
                && existing.table_name == new_migration.table_name
                && existing.column_name == new_migration.column_name
                && existing.job_arguments == new_migration.job_arguments
        });
        if duplicate {
            return Err(MigrationError::DuplicateMigration {
                job_class_name: new_migration.job_class_name,
                table_name: new_migration.table_name,
                column_name: new_migration.column_name,
                job_arguments: new_migration.job_arguments.to_string(),
            });
        }

        inner.next_migration_id += 1;
        let migration = BatchedMigration {
            id: inner.next_migration_id,
            schema_name: new_migration.schema_name,
            job_class_name: new_migration.job_class_name,
            batch_class_name: new_migration.batch_class_name,
            table_name: new_migration.table_name,
            column_name: new_migration.column_name,
            job_arguments: new_migration.job_arguments,
            min_value: new_migration.min_value,
            max_value: new_migration.max_value,
            batch_size: new_migration.batch_size,
            sub_batch_size: new_migration.sub_batch_size,
            interval_seconds: new_migration.interval_seconds,
            pause_ms: new_migration.pause_ms,
            min_batch_size: new_migration.min_batch_size,
            max_batch_size: new_migration.max_batch_size,
            total_tuple_count: new_migration.total_tuple_count,
            status: new_migration.status,
            started_at: None,
            failure_window_started_at: None,
            on_hold_until: None,
            created_at: now,
            updated_at: now,
        };

        inner.migrations.insert(
            migration.id,
            StoredMigration {
                migration: migration.clone(),
                locked_by: None,
                locked_until: None,
            },
        );
        Ok(migration)
    }

    async fn find_migration(&self, id: i64) -> Result<Option<BatchedMigration>> {
        Ok(self
            .inner
            .read()
            .migrations
            .get(&id)
            .map(|stored| stored.migration.clone()))
    }

    async fn find_for_configuration(
        &self,
        configuration: &MigrationConfiguration,
    ) -> Result<Option<BatchedMigration>> {
        Ok(self
            .inner
            .read()
            .migrations
            .values()
            .find(|stored| configuration.matches(&stored.migration))
            .map(|stored| stored.migration.clone()))
    }

    async fn list_migrations(&self, schema: Option<&str>) -> Result<Vec<BatchedMigration>> {
        Ok(self
            .inner
            .read()
            .migrations
            .values()
            .filter(|stored| schema.map_or(true, |schema| stored.migration.schema_name == schema))
            .map(|stored| stored.migration.clone())
            .collect())
    }

    async fn queued(&self, schema: &str) -> Result<Vec<BatchedMigration>> {
        Ok(self
            .inner
            .read()
            .migrations
            .values()
            .filter(|stored| {
                stored.migration.schema_name == schema && stored.migration.status.is_queued()
            })
            .map(|stored| stored.migration.clone())
            .collect())
    }

    async fn save_migration(&self, migration: &BatchedMigration) -> Result<()> {
        let mut inner = self.inner.write();
        let stored = inner
            .migrations
            .get_mut(&migration.id)
            .ok_or_else(|| MigrationError::migration_not_found(migration.id))?;
        stored.migration = migration.clone();
        Ok(())
    }

    async fn update_migration_status(
        &self,
        migration: &BatchedMigration,
        expected: MigrationStatus,
    ) -> Result<bool> {
        let mut inner = self.inner.write();
        let stored = &mut inner
            .migrations
            .get_mut(&migration.id)
            .ok_or_else(|| MigrationError::migration_not_found(migration.id))?
            .migration;
        if stored.status != expected {
            return Ok(false);
        }

        stored.status = migration.status;
        stored.started_at = migration.started_at;
        stored.failure_window_started_at = migration.failure_window_started_at;
        stored.updated_at = migration.updated_at;
        Ok(true)
    }

    async fn update_batch_sizes(
        &self,
        migration_id: i64,
        batch_size: i32,
        sub_batch_size: i32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let stored = &mut inner
            .migrations
            .get_mut(&migration_id)
            .ok_or_else(|| MigrationError::migration_not_found(migration_id))?
            .migration;
        stored.batch_size = batch_size;
        stored.sub_batch_size = sub_batch_size;
        stored.updated_at = now;
        Ok(())
    }

    async fn update_hold(
        &self,
        migration_id: i64,
        on_hold_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let stored = &mut inner
            .migrations
            .get_mut(&migration_id)
            .ok_or_else(|| MigrationError::migration_not_found(migration_id))?
            .migration;
        stored.on_hold_until = on_hold_until;
        stored.updated_at = now;
        Ok(())
    }

    async fn active_migration(
        &self,
        schema: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchedMigration>> {
        Ok(self
            .inner
            .read()
            .executable(schema, now)
            .next()
            .map(|stored| stored.migration.clone()))
    }

    async fn claim_active_migration(
        &self,
        schema: &str,
        executor_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchedMigration>> {
        let mut inner = self.inner.write();
        let Some(id) = inner
            .executable(schema, now)
            .find(|stored| stored.lease_available(executor_id, now))
            .map(|stored| stored.migration.id)
        else {
            return Ok(None);
        };

        let stored = inner
            .migrations
            .get_mut(&id)
            .ok_or_else(|| MigrationError::migration_not_found(id))?;
        stored.locked_by = Some(executor_id.to_string());
        stored.locked_until = Some(now + lease);
        Ok(Some(stored.migration.clone()))
    }

    async fn release_migration(&self, migration_id: i64, executor_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(stored) = inner.migrations.get_mut(&migration_id) {
            if stored.locked_by.as_deref() == Some(executor_id) {
                stored.locked_by = None;
                stored.locked_until = None;
            }
        }
        Ok(())
    }

    async fn create_job(&self, job: NewBatchedJob, now: DateTime<Utc>) -> Result<BatchedJob> {
        let mut inner = self.inner.write();
        if !inner.migrations.contains_key(&job.batched_migration_id) {
            return Err(MigrationError::migration_not_found(job.batched_migration_id));
        }
        Ok(inner.insert_job(job, JobStatus::Pending, now))
    }

    async fn find_job(&self, id: i64) -> Result<Option<BatchedJob>> {
        Ok(self.inner.read().jobs.get(&id).cloned())
    }

    async fn save_job(&self, job: &BatchedJob) -> Result<()> {
        let mut inner = self.inner.write();
        let stored = inner
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| MigrationError::job_not_found(job.id))?;
        *stored = job.clone();
        Ok(())
    }

    async fn last_job(&self, migration_id: i64) -> Result<Option<BatchedJob>> {
        Ok(self
            .inner
            .read()
            .jobs_of(migration_id)
            .max_by_key(|job| (job.max_value, job.id))
            .cloned())
    }

    async fn jobs_for_migration(&self, migration_id: i64) -> Result<Vec<BatchedJob>> {
        let mut jobs: Vec<BatchedJob> = self.inner.read().jobs_of(migration_id).cloned().collect();
        jobs.sort_by_key(|job| (job.min_value, job.id));
        Ok(jobs)
    }

    async fn jobs_with_status(&self, migration_id: i64, page: JobPage) -> Result<Vec<BatchedJob>> {
        Ok(self
            .inner
            .read()
            .jobs_of(migration_id)
            .filter(|job| {
                job.status == page.status && job.id > page.after_id && job.id <= page.until_id
            })
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn first_retriable_job(
        &self,
        migration_id: i64,
        max_attempts: i32,
        stuck_before: DateTime<Utc>,
    ) -> Result<Option<BatchedJob>> {
        Ok(self
            .inner
            .read()
            .jobs_of(migration_id)
            .filter(|job| job.is_retriable(max_attempts) || job.is_stuck(stuck_before))
            .min_by_key(|job| (job.min_value, job.id))
            .cloned())
    }

    async fn count_jobs(&self, migration_id: i64, query: JobCountQuery) -> Result<i64> {
        let count = self
            .inner
            .read()
            .jobs_of(migration_id)
            .filter(|job| query.matches(job))
            .count();
        Ok(count as i64)
    }

    async fn recent_successful_jobs(
        &self,
        migration_id: i64,
        limit: usize,
    ) -> Result<Vec<BatchedJob>> {
        let mut jobs: Vec<BatchedJob> = self
            .inner
            .read()
            .jobs_of(migration_id)
            .filter(|job| job.status == JobStatus::Succeeded)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            b.finished_at
                .cmp(&a.finished_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn successful_rows_counts(&self, migration_ids: &[i64]) -> Result<HashMap<i64, i64>> {
        let inner = self.inner.read();
        let mut counts = HashMap::new();
        for job in inner.jobs.values() {
            if job.status == JobStatus::Succeeded && migration_ids.contains(&job.batched_migration_id)
            {
                *counts.entry(job.batched_migration_id).or_insert(0) += i64::from(job.batch_size);
            }
        }
        Ok(counts)
    }

    async fn max_job_id(&self, migration_id: i64) -> Result<i64> {
        Ok(self
            .inner
            .read()
            .jobs_of(migration_id)
            .map(|job| job.id)
            .max()
            .unwrap_or(0))
    }

    async fn split_job(
        &self,
        job: &BatchedJob,
        sibling: NewBatchedJob,
        now: DateTime<Utc>,
    ) -> Result<BatchedJob> {
        let mut inner = self.inner.write();
        if !inner.jobs.contains_key(&job.id) {
            return Err(MigrationError::job_not_found(job.id));
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(inner.insert_job(sibling, JobStatus::Failed, now))
    }
}
