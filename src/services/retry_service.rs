use crate::clock::Clock;
use crate::config::{EngineConfig, FailureWindowPolicy};
use crate::error::{MigrationError, Result};
use crate::models::{BatchedJob, BatchedMigration, NewBatchedJob};
use crate::registry::{BatchRequest, MigrationRegistry};
use crate::state_machine::{
    JobEvent, JobStateMachine, JobStatus, MigrationEvent, MigrationStateMachine,
};
use crate::store::{JobPage, MigrationStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Outcome of splitting one failed job
#[derive(Debug, Clone, PartialEq)]
pub enum SplitOutcome {
    /// Range kept, attempts reset (batch size halved when it was above 1)
    AttemptsReset,
    /// Range halved; the sibling covers the upper part
    Split { sibling: BatchedJob },
}

/// Totals of a `retry_failed_jobs` pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySummary {
    pub retried_jobs: usize,
    pub split_jobs: usize,
}

/// Retry and attempt management for failed and blocked batch jobs.
///
/// Job sets are walked in bounded id-ordered pages so no single pass holds a long-lived
/// lock over all of a migration's jobs.
pub struct RetryService {
    store: Arc<dyn MigrationStore>,
    registry: Arc<MigrationRegistry>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    migration_machine: MigrationStateMachine,
    job_machine: JobStateMachine,
}

impl RetryService {
    pub fn new(
        store: Arc<dyn MigrationStore>,
        registry: Arc<MigrationRegistry>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let migration_machine = MigrationStateMachine::new(store.clone(), clock.clone());
        let job_machine =
            JobStateMachine::new(store.clone(), clock.clone(), config.retry.max_attempts);
        Self {
            store,
            registry,
            clock,
            config,
            migration_machine,
            job_machine,
        }
    }

    /// Halve a failed job's range so a recurring failure is confined to a smaller batch
    #[instrument(skip(self, migration, job), fields(job_id = job.id))]
    pub async fn split_and_retry(
        &self,
        migration: &BatchedMigration,
        job: &mut BatchedJob,
    ) -> Result<SplitOutcome> {
        if job.status != JobStatus::Failed {
            return Err(MigrationError::ValidationError(format!(
                "Only failed jobs can be split, job {} is {}",
                job.id, job.status
            )));
        }

        let new_batch_size = job.batch_size / 2;
        if new_batch_size < 1 {
            self.reset_job_attempts(job).await?;
            return Ok(SplitOutcome::AttemptsReset);
        }

        let strategy = self.registry.strategy(&migration.batch_class_name)?;
        let mut request = BatchRequest::for_migration(migration, job.min_value, new_batch_size);
        request.max_value = job.max_value;
        let next_batch = strategy.next_batch(&request).await?;

        let now = self.clock.now();
        job.batch_size = new_batch_size;
        job.sub_batch_size = job.sub_batch_size.min(new_batch_size);
        job.attempts = 0;
        job.updated_at = now;

        // Ids past the current max already belong to the next job
        let midpoint = match next_batch {
            Some(range) if range.max < job.max_value => range.max,
            _ => {
                self.store.save_job(job).await?;
                debug!(job_id = job.id, batch_size = new_batch_size, "Job not split, batch size lowered");
                return Ok(SplitOutcome::AttemptsReset);
            }
        };

        let sibling = NewBatchedJob {
            batched_migration_id: job.batched_migration_id,
            min_value: midpoint + 1,
            max_value: job.max_value,
            batch_size: job.batch_size,
            sub_batch_size: job.sub_batch_size,
            pause_ms: job.pause_ms,
        };
        job.max_value = midpoint;

        let sibling = self.store.split_job(job, sibling, now).await?;
        info!(
            job_id = job.id,
            sibling_job_id = sibling.id,
            range = %job.range(),
            sibling_range = %sibling.range(),
            "Split failed job"
        );

        Ok(SplitOutcome::Split { sibling })
    }

    /// Split and retry every failed job, then make the migration active again
    #[instrument(skip(self, migration), fields(migration_id = migration.id))]
    pub async fn retry_failed_jobs(&self, migration: &mut BatchedMigration) -> Result<RetrySummary> {
        let until_id = self.store.max_job_id(migration.id).await?;
        let mut summary = RetrySummary::default();
        let mut after_id = 0;

        loop {
            let page = self
                .store
                .jobs_with_status(
                    migration.id,
                    JobPage {
                        status: JobStatus::Failed,
                        after_id,
                        until_id,
                        limit: self.config.retry.sub_batch_size,
                    },
                )
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after_id = last.id;

            for mut job in page {
                if let SplitOutcome::Split { .. } = self.split_and_retry(migration, &mut job).await? {
                    summary.split_jobs += 1;
                }
                summary.retried_jobs += 1;
            }
        }

        if self.config.failure_monitor.window == FailureWindowPolicy::ResetOnRetry {
            migration.failure_window_started_at = Some(self.clock.now());
        }
        self.migration_machine
            .transition(migration, MigrationEvent::Execute)
            .await?;

        info!(
            migration_id = migration.id,
            retried_jobs = summary.retried_jobs,
            split_jobs = summary.split_jobs,
            "Retried failed jobs"
        );
        Ok(summary)
    }

    /// Administrative escape hatch: make blocked jobs retriable again
    #[instrument(skip(self, migration), fields(migration_id = migration.id))]
    pub async fn reset_attempts_of_blocked_jobs(&self, migration: &BatchedMigration) -> Result<usize> {
        let until_id = self.store.max_job_id(migration.id).await?;
        let mut reset = 0;
        let mut after_id = 0;

        loop {
            let page = self
                .store
                .jobs_with_status(
                    migration.id,
                    JobPage {
                        status: JobStatus::BlockedByMaxAttempts,
                        after_id,
                        until_id,
                        limit: self.config.retry.sub_batch_size,
                    },
                )
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after_id = last.id;

            for mut job in page {
                self.reset_job_attempts(&mut job).await?;
                reset += 1;
            }
        }

        info!(migration_id = migration.id, reset_jobs = reset, "Reset blocked jobs");
        Ok(reset)
    }

    async fn reset_job_attempts(&self, job: &mut BatchedJob) -> Result<()> {
        self.job_machine
            .transition(job, JobEvent::ResetAttempts)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{BatchRange, NewBatchedMigration};
    use crate::registry::BatchingStrategy;
    use crate::state_machine::MigrationStatus;
    use crate::store::in_memory::InMemoryMigrationStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Dense strategy that records every request it sees
    #[derive(Default)]
    struct RecordingStrategy {
        requests: Mutex<Vec<(i64, i32)>>,
    }

    #[async_trait]
    impl BatchingStrategy for RecordingStrategy {
        fn name(&self) -> &str {
            "RecordingStrategy"
        }

        async fn next_batch(&self, request: &BatchRequest) -> Result<Option<BatchRange>> {
            self.requests
                .lock()
                .push((request.batch_min_value, request.batch_size));
            let max = request.batch_min_value + i64::from(request.batch_size) - 1;
            Ok(Some(BatchRange {
                min: request.batch_min_value,
                max,
            }))
        }
    }

    struct Fixture {
        store: Arc<InMemoryMigrationStore>,
        strategy: Arc<RecordingStrategy>,
        service: RetryService,
        migration: BatchedMigration,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryMigrationStore::new());
        let clock = Arc::new(ManualClock::frozen());
        let registry = Arc::new(MigrationRegistry::new());
        let strategy = Arc::new(RecordingStrategy::default());
        registry.register_strategy(strategy.clone()).unwrap();

        let migration = store
            .create_migration(
                NewBatchedMigration::new("CopyJob", "RecordingStrategy", "events", "id", 1, 100)
                    .with_batch_sizes(10, 5),
                clock.now(),
            )
            .await
            .unwrap();
        let service = RetryService::new(store.clone(), registry, clock, EngineConfig::default());

        Fixture {
            store,
            strategy,
            service,
            migration,
        }
    }

    async fn failed_job(fixture: &Fixture, min: i64, max: i64, batch_size: i32) -> BatchedJob {
        let mut job = fixture
            .store
            .create_job(
                fixture.migration.new_job(BatchRange::new(min, max).unwrap()),
                chrono::Utc::now(),
            )
            .await
            .unwrap();
        job.status = JobStatus::Failed;
        job.attempts = 3;
        job.batch_size = batch_size;
        fixture.store.save_job(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_split_halves_the_range() {
        let fixture = fixture().await;
        let mut job = failed_job(&fixture, 6, 15, 10).await;

        let outcome = fixture
            .service
            .split_and_retry(&fixture.migration, &mut job)
            .await
            .unwrap();

        assert_eq!(*fixture.strategy.requests.lock(), vec![(6, 5)]);
        let SplitOutcome::Split { sibling } = outcome else {
            panic!("expected a split");
        };
        assert_eq!(job.range(), BatchRange { min: 6, max: 10 });
        assert_eq!((job.batch_size, job.attempts), (5, 0));
        assert_eq!(sibling.range(), BatchRange { min: 11, max: 15 });
        assert_eq!(sibling.status, JobStatus::Failed);
        assert_eq!((sibling.batch_size, sibling.attempts), (5, 0));

        let stored = fixture.store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.max_value, 10);
    }

    #[tokio::test]
    async fn test_single_row_job_only_resets_attempts() {
        let fixture = fixture().await;
        let mut job = failed_job(&fixture, 7, 7, 1).await;

        let outcome = fixture
            .service
            .split_and_retry(&fixture.migration, &mut job)
            .await
            .unwrap();

        assert_eq!(outcome, SplitOutcome::AttemptsReset);
        assert!(fixture.strategy.requests.lock().is_empty());
        assert_eq!((job.attempts, job.batch_size), (0, 1));
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_midpoint_past_max_lowers_batch_size() {
        let fixture = fixture().await;
        // A sparse range: half of the batch size still reaches past max_value
        let mut job = failed_job(&fixture, 1, 3, 10).await;

        let outcome = fixture
            .service
            .split_and_retry(&fixture.migration, &mut job)
            .await
            .unwrap();

        assert_eq!(outcome, SplitOutcome::AttemptsReset);
        assert_eq!(job.range(), BatchRange { min: 1, max: 3 });
        assert_eq!((job.batch_size, job.attempts), (5, 0));
    }

    #[tokio::test]
    async fn test_only_failed_jobs_can_be_split() {
        let fixture = fixture().await;
        let mut job = failed_job(&fixture, 1, 10, 10).await;
        job.status = JobStatus::Succeeded;

        let result = fixture
            .service
            .split_and_retry(&fixture.migration, &mut job)
            .await;
        assert!(matches!(result, Err(MigrationError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_retry_failed_jobs_splits_each_once() {
        let fixture = fixture().await;
        failed_job(&fixture, 1, 10, 10).await;
        failed_job(&fixture, 11, 20, 10).await;

        let mut migration = fixture.migration.clone();
        migration.status = MigrationStatus::Failed;
        fixture.store.save_migration(&migration).await.unwrap();

        let summary = fixture
            .service
            .retry_failed_jobs(&mut migration)
            .await
            .unwrap();

        assert_eq!(
            summary,
            RetrySummary {
                retried_jobs: 2,
                split_jobs: 2
            }
        );
        assert_eq!(migration.status, MigrationStatus::Active);

        let jobs = fixture.store.jobs_for_migration(migration.id).await.unwrap();
        let ranges: Vec<(i64, i64)> = jobs.iter().map(|j| (j.min_value, j.max_value)).collect();
        assert_eq!(ranges, vec![(1, 5), (6, 10), (11, 15), (16, 20)]);
        assert!(jobs.iter().all(|j| j.attempts == 0));
    }

    #[tokio::test]
    async fn test_retry_without_failed_jobs_still_activates() {
        let fixture = fixture().await;
        let mut migration = fixture.migration.clone();

        let summary = fixture
            .service
            .retry_failed_jobs(&mut migration)
            .await
            .unwrap();

        assert_eq!(summary, RetrySummary::default());
        assert_eq!(migration.status, MigrationStatus::Active);
        assert!(fixture
            .store
            .jobs_for_migration(migration.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_reset_attempts_of_blocked_jobs() {
        let fixture = fixture().await;
        let mut blocked = failed_job(&fixture, 1, 10, 10).await;
        blocked.status = JobStatus::BlockedByMaxAttempts;
        fixture.store.save_job(&blocked).await.unwrap();

        let reset = fixture
            .service
            .reset_attempts_of_blocked_jobs(&fixture.migration)
            .await
            .unwrap();

        assert_eq!(reset, 1);
        let stored = fixture.store.find_job(blocked.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 0);
        assert!(stored.is_retriable(3));
    }
}
