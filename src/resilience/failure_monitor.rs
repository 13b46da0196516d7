//! # Failure Monitor
//!
//! Failure-ratio circuit breaker for batched migrations. A single flaky batch must not stop
//! a long migration, but a sustained failure rate over enough samples will.
//!
//! The monitor only judges once the migration has started, and only looks at jobs created
//! inside the sampling window (see [`FailureWindowPolicy`]). Below `minimum_jobs` samples it
//! never trips.

use crate::config::{FailureMonitorConfig, FailureWindowPolicy};
use crate::error::Result;
use crate::models::BatchedMigration;
use crate::state_machine::JobStatus;
use crate::store::{JobCountQuery, MigrationStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Job counts inside the sampling window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSample {
    pub total_jobs: i64,
    pub failed_jobs: i64,
}

impl FailureSample {
    pub fn failure_ratio(&self) -> Option<f64> {
        if self.total_jobs == 0 {
            return None;
        }
        Some(self.failed_jobs as f64 / self.total_jobs as f64)
    }
}

#[derive(Debug, Clone)]
pub struct FailureMonitor {
    config: FailureMonitorConfig,
}

impl FailureMonitor {
    pub fn new(config: FailureMonitorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FailureMonitorConfig {
        &self.config
    }

    /// Pure decision over a sample
    pub fn should_stop_for(&self, sample: FailureSample) -> bool {
        if sample.total_jobs < self.config.minimum_jobs {
            return false;
        }

        sample
            .failure_ratio()
            .is_some_and(|ratio| ratio > self.config.maximum_failed_ratio)
    }

    /// Start of the sampling window; `None` until the migration has started
    pub fn window_start(&self, migration: &BatchedMigration) -> Option<DateTime<Utc>> {
        let started_at = migration.started_at?;
        match self.config.window {
            FailureWindowPolicy::Cumulative => Some(started_at),
            FailureWindowPolicy::ResetOnRetry => {
                Some(migration.failure_window_started_at.unwrap_or(started_at))
            }
        }
    }

    /// Count jobs inside the sampling window. Blocked jobs count as failures.
    pub async fn sample(
        &self,
        migration: &BatchedMigration,
        store: &dyn MigrationStore,
    ) -> Result<Option<FailureSample>> {
        let Some(since) = self.window_start(migration) else {
            return Ok(None);
        };

        let total_jobs = store
            .count_jobs(migration.id, JobCountQuery::default().created_since(since))
            .await?;
        let failed_jobs = store
            .count_jobs(
                migration.id,
                JobCountQuery::default()
                    .with_statuses(&[JobStatus::Failed, JobStatus::BlockedByMaxAttempts])
                    .created_since(since),
            )
            .await?;

        Ok(Some(FailureSample {
            total_jobs,
            failed_jobs,
        }))
    }

    pub async fn should_stop(
        &self,
        migration: &BatchedMigration,
        store: &dyn MigrationStore,
    ) -> Result<bool> {
        let Some(sample) = self.sample(migration, store).await? else {
            debug!(migration_id = migration.id, "Failure monitor skipped, migration not started");
            return Ok(false);
        };

        let stop = self.should_stop_for(sample);
        if stop {
            warn!(
                migration_id = migration.id,
                job_class_name = %migration.job_class_name,
                total_jobs = sample.total_jobs,
                failed_jobs = sample.failed_jobs,
                maximum_failed_ratio = self.config.maximum_failed_ratio,
                "Failure ratio exceeded, {} should stop",
                migration
            );
        }

        Ok(stop)
    }
}

impl Default for FailureMonitor {
    fn default() -> Self {
        Self::new(FailureMonitorConfig::default())
    }
}
