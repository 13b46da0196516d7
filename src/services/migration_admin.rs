//! # Migration Administration
//!
//! Operator-facing surface over queued migrations: queueing, status transitions, retry and
//! hold controls, and read-only progress reporting. Every mutating operation goes through
//! the migration state machine so guards and logging apply exactly as they do for the
//! executor.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{MigrationError, Result};
use crate::logging::log_migration_operation;
use crate::models::{BatchedMigration, NewBatchedMigration};
use crate::registry::MigrationRegistry;
use crate::resilience::FailureMonitor;
use crate::state_machine::{JobStatus, MigrationEvent, MigrationStateMachine, MigrationStatus};
use crate::store::{JobCountQuery, MigrationStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};

use super::retry_service::{RetryService, RetrySummary};

/// Job counts of one migration by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: i64,
    pub running: i64,
    pub failed: i64,
    pub succeeded: i64,
    pub blocked_by_max_attempts: i64,
}

impl JobCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.running + self.failed + self.succeeded + self.blocked_by_max_attempts
    }
}

/// Read-only snapshot of a migration for operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationStatusReport {
    pub id: i64,
    pub identifier: String,
    pub status: MigrationStatus,
    pub on_hold: bool,
    pub on_hold_until: Option<DateTime<Utc>>,
    pub batch_size: i32,
    pub sub_batch_size: i32,
    pub job_counts: JobCounts,
    /// Failed share of the jobs in the current failure window; `None` before activation
    pub failure_ratio: Option<f64>,
    pub migrated_tuple_count: i64,
    pub total_tuple_count: Option<i64>,
    pub progress_percentage: Option<f64>,
    pub estimated_seconds_remaining: Option<i64>,
}

pub struct MigrationAdmin {
    store: Arc<dyn MigrationStore>,
    registry: Arc<MigrationRegistry>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    state_machine: MigrationStateMachine,
    retry_service: RetryService,
    failure_monitor: FailureMonitor,
}

impl MigrationAdmin {
    pub fn new(
        store: Arc<dyn MigrationStore>,
        registry: Arc<MigrationRegistry>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let state_machine = MigrationStateMachine::new(store.clone(), clock.clone());
        let retry_service =
            RetryService::new(store.clone(), registry.clone(), clock.clone(), config.clone());
        let failure_monitor = FailureMonitor::new(config.failure_monitor.clone());
        Self {
            store,
            registry,
            clock,
            config,
            state_machine,
            retry_service,
            failure_monitor,
        }
    }

    /// Validate and persist a new migration.
    ///
    /// Both class names must already be registered, and the identity tuple
    /// `(job_class_name, table_name, column_name, job_arguments)` must be unused.
    #[instrument(skip(self, migration), fields(job_class = %migration.job_class_name))]
    pub async fn queue_migration(&self, migration: NewBatchedMigration) -> Result<BatchedMigration> {
        migration.validate()?;
        self.registry
            .validate_classes(&migration.job_class_name, &migration.batch_class_name)?;

        let migration = self
            .store
            .create_migration(migration, self.clock.now())
            .await?;

        log_migration_operation(
            "queue",
            migration.id,
            &migration.job_class_name,
            &migration.status.to_string(),
            Some(&migration.identifier()),
        );
        Ok(migration)
    }

    pub async fn find(&self, migration_id: i64) -> Result<BatchedMigration> {
        self.store
            .find_migration(migration_id)
            .await?
            .ok_or_else(|| MigrationError::migration_not_found(migration_id))
    }

    pub async fn pause(&self, migration_id: i64) -> Result<BatchedMigration> {
        self.apply(migration_id, MigrationEvent::Pause).await
    }

    /// Make the migration eligible for dispatch again
    pub async fn resume(&self, migration_id: i64) -> Result<BatchedMigration> {
        self.apply(migration_id, MigrationEvent::Execute).await
    }

    /// Rejected while any job has not succeeded
    pub async fn finish(&self, migration_id: i64) -> Result<BatchedMigration> {
        self.apply(migration_id, MigrationEvent::Finish).await
    }

    pub async fn retry_failed_jobs(&self, migration_id: i64) -> Result<RetrySummary> {
        let mut migration = self.find(migration_id).await?;
        self.retry_service.retry_failed_jobs(&mut migration).await
    }

    pub async fn reset_attempts_of_blocked_jobs(&self, migration_id: i64) -> Result<usize> {
        let migration = self.find(migration_id).await?;
        self.retry_service
            .reset_attempts_of_blocked_jobs(&migration)
            .await
    }

    /// Suppress dispatch until `until_time`, or for the configured default hold
    pub async fn hold(
        &self,
        migration_id: i64,
        until_time: Option<DateTime<Utc>>,
    ) -> Result<BatchedMigration> {
        let mut migration = self.find(migration_id).await?;
        let now = self.clock.now();
        let until_time = until_time.unwrap_or_else(|| now + self.config.hold.default_hold());
        if until_time <= now {
            return Err(MigrationError::ValidationError(format!(
                "Hold of {migration} must end in the future, got {until_time}"
            )));
        }

        self.store
            .update_hold(migration.id, Some(until_time), now)
            .await?;
        migration.hold(until_time, now);
        Ok(migration)
    }

    pub async fn status_report(&self, migration_id: i64) -> Result<MigrationStatusReport> {
        let migration = self.find(migration_id).await?;
        let now = self.clock.now();

        let job_counts = JobCounts {
            pending: self.count(migration.id, JobStatus::Pending).await?,
            running: self.count(migration.id, JobStatus::Running).await?,
            failed: self.count(migration.id, JobStatus::Failed).await?,
            succeeded: self.count(migration.id, JobStatus::Succeeded).await?,
            blocked_by_max_attempts: self
                .count(migration.id, JobStatus::BlockedByMaxAttempts)
                .await?,
        };
        let failure_ratio = self
            .failure_monitor
            .sample(&migration, self.store.as_ref())
            .await?
            .and_then(|sample| sample.failure_ratio());
        let migrated_tuple_count = migration.migrated_tuple_count(self.store.as_ref()).await?;

        Ok(MigrationStatusReport {
            id: migration.id,
            identifier: migration.identifier(),
            status: migration.status,
            on_hold: migration.is_on_hold(now),
            on_hold_until: migration.on_hold_until,
            batch_size: migration.batch_size,
            sub_batch_size: migration.sub_batch_size,
            job_counts,
            failure_ratio,
            migrated_tuple_count,
            total_tuple_count: migration.total_tuple_count,
            progress_percentage: migration.progress_percentage(migrated_tuple_count),
            estimated_seconds_remaining: migration
                .estimated_time_remaining(migrated_tuple_count)
                .map(|remaining| remaining.num_seconds()),
        })
    }

    /// Active or paused migrations of the configured schema, oldest first
    pub async fn list_queued(&self) -> Result<Vec<BatchedMigration>> {
        self.store.queued(&self.config.executor.schema).await
    }

    async fn apply(&self, migration_id: i64, event: MigrationEvent) -> Result<BatchedMigration> {
        let mut migration = self.find(migration_id).await?;
        self.state_machine.transition(&mut migration, event).await?;
        info!(migration_id, event = event.event_type(), status = %migration.status, "Applied administrative event");
        Ok(migration)
    }

    async fn count(&self, migration_id: i64, status: JobStatus) -> Result<i64> {
        self.store
            .count_jobs(migration_id, JobCountQuery::default().with_status(status))
            .await
    }
}
