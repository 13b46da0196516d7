//! # Migration Runner
//!
//! Drives one migration forward by one batch job per call.
//!
//! A call either creates the next contiguous job from the batching strategy, or picks up the
//! first retriable job once the strategy has run past `max_value`. Once neither exists the
//! migration is settled: `finish` when every job succeeded, `failure` when any job failed,
//! and nothing while another executor still has a job in flight.
//!
//! After a job runs, failures consult the [`FailureMonitor`] and successes feed the
//! [`BatchOptimizer`].

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{JobFailure, MigrationError, Result};
use crate::models::{BatchRange, BatchedJob, BatchedMigration};
use crate::optimizer::{BatchOptimizer, BatchSizeChange};
use crate::registry::{
    BatchRequest, BatchedJobHandler, BatchingStrategy, JobContext, MigrationRegistry,
};
use crate::resilience::FailureMonitor;
use crate::state_machine::{
    JobEvent, JobStateMachine, JobStatus, MigrationEvent, MigrationStateMachine, MigrationStatus,
    StateMachineError,
};
use crate::store::{JobCountQuery, MigrationStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

const STUCK_JOB_REASON: &str = "stuck job timed out";

/// Result of one runner step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// Not active, or on hold, or an operator changed the status mid-step
    NotExecutable,
    /// Last job was created less than one interval ago
    IntervalNotElapsed,
    JobSucceeded {
        job_id: i64,
        range: BatchRange,
        batch_size_change: Option<BatchSizeChange>,
    },
    JobFailed {
        job_id: i64,
        status: JobStatus,
        /// The failure monitor tripped and the migration was failed
        migration_failed: bool,
    },
    /// No job to run but one is still running elsewhere
    AwaitingInFlightJobs,
    MigrationFinished,
    MigrationFailed { reason: String },
}

pub struct BatchedMigrationRunner {
    store: Arc<dyn MigrationStore>,
    registry: Arc<MigrationRegistry>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    migration_machine: MigrationStateMachine,
    job_machine: JobStateMachine,
    failure_monitor: FailureMonitor,
    optimizer: BatchOptimizer,
}

impl BatchedMigrationRunner {
    pub fn new(
        store: Arc<dyn MigrationStore>,
        registry: Arc<MigrationRegistry>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let migration_machine = MigrationStateMachine::new(store.clone(), clock.clone());
        let job_machine =
            JobStateMachine::new(store.clone(), clock.clone(), config.retry.max_attempts);
        let failure_monitor = FailureMonitor::new(config.failure_monitor.clone());
        let optimizer = BatchOptimizer::new(config.optimizer.clone());
        Self {
            store,
            registry,
            clock,
            config,
            migration_machine,
            job_machine,
            failure_monitor,
            optimizer,
        }
    }

    /// Run the next batch job of an executable migration, respecting the interval gate
    #[instrument(skip(self, migration), fields(migration_id = migration.id))]
    pub async fn run_migration_job(&self, migration: &mut BatchedMigration) -> Result<RunOutcome> {
        if !migration.is_executable(self.clock.now()) {
            debug!(migration_id = migration.id, status = %migration.status, "Migration not executable");
            return Ok(RunOutcome::NotExecutable);
        }
        self.step(migration, true).await
    }

    /// Run every remaining batch inline, ignoring the interval gate and holds.
    ///
    /// A finished migration is left alone; a failed one has to be retried first.
    #[instrument(skip(self, migration), fields(migration_id = migration.id))]
    pub async fn finalize(&self, migration: &mut BatchedMigration) -> Result<RunOutcome> {
        match migration.status {
            MigrationStatus::Finished => return Ok(RunOutcome::MigrationFinished),
            MigrationStatus::Failed => {
                return Err(MigrationError::InvalidTransition(format!(
                    "{migration} has failed and cannot be finalized"
                )))
            }
            _ => {}
        }

        self.migration_machine
            .transition(migration, MigrationEvent::Finalize)
            .await?;

        let mut outcome = RunOutcome::AwaitingInFlightJobs;
        while migration.status == MigrationStatus::Finalizing {
            outcome = self.step(migration, false).await?;
            if outcome == RunOutcome::AwaitingInFlightJobs {
                warn!(migration_id = migration.id, "Finalize stopped on a job running elsewhere");
                break;
            }
        }

        info!(migration_id = migration.id, status = %migration.status, "Finalize completed");
        Ok(outcome)
    }

    async fn step(&self, migration: &mut BatchedMigration, gated: bool) -> Result<RunOutcome> {
        let now = self.clock.now();
        let last_job = self.store.last_job(migration.id).await?;

        if gated
            && !migration.interval_elapsed(
                last_job.as_ref(),
                now,
                self.config.executor.interval_variance(),
            )
        {
            return Ok(RunOutcome::IntervalNotElapsed);
        }

        let (handler, strategy) = match self.resolve_classes(migration) {
            Ok(classes) => classes,
            Err(err) => return self.fail_migration(migration, err.to_string()).await,
        };

        let next_job = self
            .find_or_create_next_batched_job(migration, last_job.as_ref(), strategy.as_ref())
            .await?;

        match next_job {
            Some(job) => self.execute_job(migration, handler.as_ref(), job).await,
            None => self.settle(migration).await,
        }
    }

    fn resolve_classes(
        &self,
        migration: &BatchedMigration,
    ) -> Result<(Arc<dyn BatchedJobHandler>, Arc<dyn BatchingStrategy>)> {
        let handler = self.registry.job_class(&migration.job_class_name)?;
        let strategy = self.registry.strategy(&migration.batch_class_name)?;
        Ok((handler, strategy))
    }

    /// The next contiguous range if the strategy has one, else the first retriable job
    async fn find_or_create_next_batched_job(
        &self,
        migration: &BatchedMigration,
        last_job: Option<&BatchedJob>,
        strategy: &dyn BatchingStrategy,
    ) -> Result<Option<BatchedJob>> {
        if let Some(range) = self.next_range(migration, last_job, strategy).await? {
            let job = migration
                .create_batched_job(self.store.as_ref(), range.min, range.max, self.clock.now())
                .await?;
            debug!(migration_id = migration.id, job_id = job.id, range = %range, "Created batched job");
            return Ok(Some(job));
        }

        let stuck_before = self.clock.now() - self.config.retry.stuck_job_timeout();
        self.store
            .first_retriable_job(migration.id, self.config.retry.max_attempts, stuck_before)
            .await
    }

    async fn next_range(
        &self,
        migration: &BatchedMigration,
        last_job: Option<&BatchedJob>,
        strategy: &dyn BatchingStrategy,
    ) -> Result<Option<BatchRange>> {
        let Some(next_min) = migration
            .next_min_value(last_job)
            .filter(|next_min| *next_min <= migration.max_value)
        else {
            return Ok(None);
        };

        let request = BatchRequest::for_migration(migration, next_min, migration.batch_size);
        let Some(range) = strategy.next_batch(&request).await? else {
            return Ok(None);
        };
        if range.min != next_min {
            return Err(MigrationError::StrategyError(format!(
                "{} returned {range} for a batch starting at {next_min}",
                strategy.name()
            )));
        }

        Ok(range.clamp_max(migration.max_value))
    }

    async fn execute_job(
        &self,
        migration: &mut BatchedMigration,
        handler: &dyn BatchedJobHandler,
        mut job: BatchedJob,
    ) -> Result<RunOutcome> {
        if job.status == JobStatus::Running {
            warn!(migration_id = migration.id, job_id = job.id, "Recovering stuck job");
            let status = self
                .job_machine
                .record_failure(&mut job, &JobFailure::retryable(STUCK_JOB_REASON))
                .await?;
            if status == JobStatus::BlockedByMaxAttempts {
                return self.job_failed(migration, &job).await;
            }
        }

        self.job_machine.transition(&mut job, JobEvent::Start).await?;
        let context = JobContext::for_job(migration, &job);

        match handler.perform(&context).await {
            Ok(()) => {
                self.job_machine
                    .transition(&mut job, JobEvent::Succeed)
                    .await?;
                let batch_size_change = self
                    .optimizer
                    .optimize(migration, self.store.as_ref(), self.clock.now())
                    .await?;
                Ok(RunOutcome::JobSucceeded {
                    job_id: job.id,
                    range: job.range(),
                    batch_size_change,
                })
            }
            Err(failure) => {
                warn!(
                    migration_id = migration.id,
                    job_id = job.id,
                    range = %job.range(),
                    retryable = failure.retryable,
                    error = %failure,
                    "Batched job failed"
                );
                self.job_machine.record_failure(&mut job, &failure).await?;
                self.job_failed(migration, &job).await
            }
        }
    }

    async fn job_failed(
        &self,
        migration: &mut BatchedMigration,
        job: &BatchedJob,
    ) -> Result<RunOutcome> {
        let migration_failed = self
            .failure_monitor
            .should_stop(migration, self.store.as_ref())
            .await?;
        let migration_failed = migration_failed
            && self
                .transition_unless_preempted(migration, MigrationEvent::Failure)
                .await?;

        Ok(RunOutcome::JobFailed {
            job_id: job.id,
            status: job.status,
            migration_failed,
        })
    }

    /// No job left to run: finish, fail, or wait for the job still in flight
    async fn settle(&self, migration: &mut BatchedMigration) -> Result<RunOutcome> {
        let in_flight = self
            .store
            .count_jobs(
                migration.id,
                JobCountQuery::default().with_statuses(&[JobStatus::Pending, JobStatus::Running]),
            )
            .await?;
        if in_flight > 0 {
            return Ok(RunOutcome::AwaitingInFlightJobs);
        }

        let failed = self
            .store
            .count_jobs(
                migration.id,
                JobCountQuery::default()
                    .with_statuses(&[JobStatus::Failed, JobStatus::BlockedByMaxAttempts]),
            )
            .await?;
        if failed > 0 {
            return self
                .fail_migration(migration, format!("{failed} batched jobs failed"))
                .await;
        }

        if !self
            .transition_unless_preempted(migration, MigrationEvent::Finish)
            .await?
        {
            return Ok(RunOutcome::NotExecutable);
        }
        info!(migration_id = migration.id, identifier = %migration.identifier(), "Migration finished");
        Ok(RunOutcome::MigrationFinished)
    }

    async fn fail_migration(
        &self,
        migration: &mut BatchedMigration,
        reason: String,
    ) -> Result<RunOutcome> {
        error!(migration_id = migration.id, reason = %reason, "Failing migration");
        if !self
            .transition_unless_preempted(migration, MigrationEvent::Failure)
            .await?
        {
            return Ok(RunOutcome::NotExecutable);
        }
        Ok(RunOutcome::MigrationFailed { reason })
    }

    /// Apply `event` unless an operator changed the status since the migration was loaded.
    ///
    /// On `false` the migration has been reloaded and the operator's status stands.
    async fn transition_unless_preempted(
        &self,
        migration: &mut BatchedMigration,
        event: MigrationEvent,
    ) -> Result<bool> {
        match self.migration_machine.transition(migration, event).await {
            Ok(_) => Ok(true),
            Err(StateMachineError::StatusChanged { .. }) => {
                info!(
                    migration_id = migration.id,
                    event = event.event_type(),
                    status = %migration.status,
                    "Runner transition preempted by a concurrent status change"
                );
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewBatchedMigration;
    use crate::strategies::PrimaryKeyBatchingStrategy;
    use crate::test_helpers::{FailingJob, NoopJob, RecordingJob, TestEngine};
    use chrono::Duration;

    fn runner(engine: &TestEngine) -> BatchedMigrationRunner {
        BatchedMigrationRunner::new(
            engine.store.clone(),
            engine.registry.clone(),
            engine.clock.clone(),
            engine.config.clone(),
        )
    }

    async fn active_migration(
        engine: &TestEngine,
        job_class: &str,
        max_value: i64,
        batch_size: i32,
    ) -> BatchedMigration {
        let mut migration = engine
            .store
            .create_migration(
                NewBatchedMigration::new(
                    job_class,
                    PrimaryKeyBatchingStrategy::NAME,
                    "events",
                    "id",
                    1,
                    max_value,
                )
                .with_batch_sizes(batch_size, batch_size)
                .with_pause_ms(0)
                .with_status(MigrationStatus::Active),
                engine.clock.now(),
            )
            .await
            .unwrap();
        migration.started_at = Some(engine.clock.now());
        engine.store.save_migration(&migration).await.unwrap();
        migration
    }

    fn interval() -> Duration {
        Duration::seconds(crate::constants::migration::DEFAULT_INTERVAL_SECONDS)
    }

    #[tokio::test]
    async fn test_jobs_follow_each_other_contiguously() {
        let recorder = Arc::new(RecordingJob::default());
        let engine = TestEngine::new().with_job_class(recorder.clone());
        let runner = runner(&engine);
        let mut migration = active_migration(&engine, RecordingJob::NAME, 250, 100).await;

        let first = runner.run_migration_job(&mut migration).await.unwrap();
        assert!(matches!(first, RunOutcome::JobSucceeded { range, .. } if range == BatchRange { min: 1, max: 100 }));

        engine.clock.advance(interval());
        runner.run_migration_job(&mut migration).await.unwrap();
        engine.clock.advance(interval());
        let last = runner.run_migration_job(&mut migration).await.unwrap();
        assert!(matches!(last, RunOutcome::JobSucceeded { range, .. } if range == BatchRange { min: 201, max: 250 }));

        assert_eq!(
            recorder.ranges(),
            vec![
                BatchRange { min: 1, max: 100 },
                BatchRange { min: 101, max: 200 },
                BatchRange { min: 201, max: 250 },
            ]
        );

        engine.clock.advance(interval());
        let outcome = runner.run_migration_job(&mut migration).await.unwrap();
        assert_eq!(outcome, RunOutcome::MigrationFinished);
        assert_eq!(migration.status, MigrationStatus::Finished);
    }

    #[tokio::test]
    async fn test_interval_gate() {
        let engine = TestEngine::new();
        let runner = runner(&engine);
        let mut migration = active_migration(&engine, NoopJob::NAME, 1_000, 100).await;

        runner.run_migration_job(&mut migration).await.unwrap();
        engine.clock.advance(Duration::seconds(60));
        let outcome = runner.run_migration_job(&mut migration).await.unwrap();
        assert_eq!(outcome, RunOutcome::IntervalNotElapsed);

        engine.clock.advance(Duration::seconds(60));
        let outcome = runner.run_migration_job(&mut migration).await.unwrap();
        assert!(matches!(outcome, RunOutcome::JobSucceeded { .. }));
    }

    #[tokio::test]
    async fn test_paused_and_held_migrations_do_not_run() {
        let engine = TestEngine::new();
        let runner = runner(&engine);
        let mut migration = active_migration(&engine, NoopJob::NAME, 1_000, 100).await;

        let now = engine.clock.now();
        migration.hold(now + Duration::minutes(5), now);
        assert_eq!(
            runner.run_migration_job(&mut migration).await.unwrap(),
            RunOutcome::NotExecutable
        );

        migration.on_hold_until = None;
        migration.status = MigrationStatus::Paused;
        assert_eq!(
            runner.run_migration_job(&mut migration).await.unwrap(),
            RunOutcome::NotExecutable
        );
        assert_eq!(engine.store.max_job_id(migration.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_job_is_retried_after_the_range_is_exhausted() {
        let failing = Arc::new(FailingJob::on_values(vec![5]));
        let engine = TestEngine::new().with_job_class(failing.clone());
        let runner = runner(&engine);
        let mut migration = active_migration(&engine, FailingJob::NAME, 20, 10).await;

        let outcome = runner.run_migration_job(&mut migration).await.unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::JobFailed {
                status: JobStatus::Failed,
                migration_failed: false,
                ..
            }
        ));

        engine.clock.advance(interval());
        assert!(matches!(
            runner.run_migration_job(&mut migration).await.unwrap(),
            RunOutcome::JobSucceeded { range, .. } if range == BatchRange { min: 11, max: 20 }
        ));

        // Strategy is exhausted, the failed job comes back until it is blocked
        for attempt in 2..=3 {
            engine.clock.advance(interval());
            let outcome = runner.run_migration_job(&mut migration).await.unwrap();
            let expected = if attempt == 3 {
                JobStatus::BlockedByMaxAttempts
            } else {
                JobStatus::Failed
            };
            assert!(matches!(outcome, RunOutcome::JobFailed { status, .. } if status == expected));
        }

        engine.clock.advance(interval());
        let outcome = runner.run_migration_job(&mut migration).await.unwrap();
        assert!(matches!(outcome, RunOutcome::MigrationFailed { .. }));
        assert_eq!(migration.status, MigrationStatus::Failed);
        assert_eq!(failing.calls(), 4);
    }

    #[tokio::test]
    async fn test_permanent_failure_blocks_immediately() {
        let engine =
            TestEngine::new().with_job_class(Arc::new(FailingJob::always().permanent()));
        let runner = runner(&engine);
        let mut migration = active_migration(&engine, FailingJob::NAME, 10, 10).await;

        let outcome = runner.run_migration_job(&mut migration).await.unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::JobFailed {
                status: JobStatus::BlockedByMaxAttempts,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_failure_monitor_fails_the_migration() {
        let engine = TestEngine::new().with_job_class(Arc::new(FailingJob::always()));
        let mut config = engine.config.clone();
        config.failure_monitor.minimum_jobs = 2;
        let engine = engine.with_config(config);
        let runner = runner(&engine);
        let mut migration = active_migration(&engine, FailingJob::NAME, 1_000, 10).await;

        let first = runner.run_migration_job(&mut migration).await.unwrap();
        assert!(matches!(first, RunOutcome::JobFailed { migration_failed: false, .. }));

        engine.clock.advance(interval());
        let second = runner.run_migration_job(&mut migration).await.unwrap();
        assert!(matches!(second, RunOutcome::JobFailed { migration_failed: true, .. }));
        assert_eq!(migration.status, MigrationStatus::Failed);
    }

    #[tokio::test]
    async fn test_unregistered_job_class_fails_the_migration() {
        let engine = TestEngine::new();
        let runner = runner(&engine);
        let mut migration = active_migration(&engine, "MissingJob", 100, 10).await;

        let outcome = runner.run_migration_job(&mut migration).await.unwrap();
        assert!(matches!(outcome, RunOutcome::MigrationFailed { .. }));
        assert_eq!(migration.status, MigrationStatus::Failed);
    }

    #[tokio::test]
    async fn test_waits_for_job_running_elsewhere() {
        let engine = TestEngine::new();
        let runner = runner(&engine);
        let mut migration = active_migration(&engine, NoopJob::NAME, 10, 10).await;

        let mut job = migration
            .create_batched_job(engine.store.as_ref(), 1, 10, engine.clock.now())
            .await
            .unwrap();
        job.status = JobStatus::Running;
        job.updated_at = engine.clock.now();
        engine.store.save_job(&job).await.unwrap();

        engine.clock.advance(interval());
        assert_eq!(
            runner.run_migration_job(&mut migration).await.unwrap(),
            RunOutcome::AwaitingInFlightJobs
        );
        assert_eq!(migration.status, MigrationStatus::Active);
    }

    #[tokio::test]
    async fn test_stuck_job_is_recovered() {
        let engine = TestEngine::new();
        let runner = runner(&engine);
        let mut migration = active_migration(&engine, NoopJob::NAME, 10, 10).await;

        let mut job = migration
            .create_batched_job(engine.store.as_ref(), 1, 10, engine.clock.now())
            .await
            .unwrap();
        job.status = JobStatus::Running;
        job.attempts = 1;
        job.updated_at = engine.clock.now();
        engine.store.save_job(&job).await.unwrap();

        engine.clock.advance(engine.config.retry.stuck_job_timeout() + Duration::seconds(1));
        let outcome = runner.run_migration_job(&mut migration).await.unwrap();
        assert!(matches!(outcome, RunOutcome::JobSucceeded { job_id, .. } if job_id == job.id));

        let stored = engine.store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(stored.attempts, 2);
    }

    #[tokio::test]
    async fn test_finalize_runs_remaining_batches_inline() {
        let recorder = Arc::new(RecordingJob::default());
        let engine = TestEngine::new().with_job_class(recorder.clone());
        let runner = runner(&engine);
        let mut migration = active_migration(&engine, RecordingJob::NAME, 500, 100).await;

        let outcome = runner.finalize(&mut migration).await.unwrap();

        assert_eq!(outcome, RunOutcome::MigrationFinished);
        assert_eq!(migration.status, MigrationStatus::Finished);
        assert_eq!(recorder.ranges().len(), 5);
    }

    #[tokio::test]
    async fn test_finalize_finished_and_failed() {
        let engine = TestEngine::new();
        let runner = runner(&engine);
        let mut migration = active_migration(&engine, NoopJob::NAME, 100, 10).await;

        migration.status = MigrationStatus::Finished;
        assert_eq!(
            runner.finalize(&mut migration).await.unwrap(),
            RunOutcome::MigrationFinished
        );

        migration.status = MigrationStatus::Failed;
        assert!(matches!(
            runner.finalize(&mut migration).await,
            Err(MigrationError::InvalidTransition(_))
        ));
    }
}
