use super::{
    errors::{StateMachineError, StateMachineResult},
    events::JobEvent,
    guards::{AttemptsRemainingGuard, StateGuard},
    states::JobStatus,
};
use crate::clock::Clock;
use crate::error::JobFailure;
use crate::logging::log_job_operation;
use crate::models::BatchedJob;
use crate::store::MigrationStore;
use std::sync::Arc;

/// Batch job lifecycle with an attempt ceiling
pub struct JobStateMachine {
    store: Arc<dyn MigrationStore>,
    clock: Arc<dyn Clock>,
    max_attempts: i32,
}

impl JobStateMachine {
    pub fn new(store: Arc<dyn MigrationStore>, clock: Arc<dyn Clock>, max_attempts: i32) -> Self {
        Self {
            store,
            clock,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    /// Determine the target state based on current state and event
    pub fn determine_target_state(
        &self,
        job: &BatchedJob,
        event: &JobEvent,
    ) -> StateMachineResult<JobStatus> {
        let target = match (job.status, event) {
            (JobStatus::Pending | JobStatus::Failed, JobEvent::Start) => JobStatus::Running,
            (JobStatus::Running, JobEvent::Succeed) => JobStatus::Succeeded,
            (JobStatus::Running, JobEvent::Fail(_)) => {
                if job.attempts >= self.max_attempts {
                    JobStatus::BlockedByMaxAttempts
                } else {
                    JobStatus::Failed
                }
            }
            (JobStatus::BlockedByMaxAttempts | JobStatus::Failed, JobEvent::ResetAttempts) => {
                JobStatus::Failed
            }
            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from_state.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    /// Apply `event` to `job` and persist it
    pub async fn transition(
        &self,
        job: &mut BatchedJob,
        event: JobEvent,
    ) -> StateMachineResult<JobStatus> {
        let target_state = self.determine_target_state(job, &event)?;
        self.apply(job, event, target_state).await
    }

    /// Record a job-class failure. Permanent failures block the job right away.
    pub async fn record_failure(
        &self,
        job: &mut BatchedJob,
        failure: &JobFailure,
    ) -> StateMachineResult<JobStatus> {
        let event = JobEvent::fail_with_error(failure.reason.clone());
        let target_state = match self.determine_target_state(job, &event)? {
            JobStatus::Failed if !failure.retryable => JobStatus::BlockedByMaxAttempts,
            target => target,
        };
        self.apply(job, event, target_state).await
    }

    async fn apply(
        &self,
        job: &mut BatchedJob,
        event: JobEvent,
        target_state: JobStatus,
    ) -> StateMachineResult<JobStatus> {
        if target_state == JobStatus::Running {
            AttemptsRemainingGuard {
                max_attempts: self.max_attempts,
            }
            .check(job, self.store.as_ref())
            .await?;
        }

        let now = self.clock.now();
        match &event {
            JobEvent::Start => {
                job.attempts += 1;
                job.started_at = Some(now);
                job.finished_at = None;
            }
            JobEvent::Succeed => {
                job.finished_at = Some(now);
                job.last_error = None;
            }
            JobEvent::Fail(reason) => {
                job.finished_at = Some(now);
                job.last_error = Some(reason.clone());
            }
            JobEvent::ResetAttempts => {
                job.attempts = 0;
            }
        }
        job.status = target_state;
        job.updated_at = now;

        self.store.save_job(job).await?;

        log_job_operation(
            event.event_type(),
            job.batched_migration_id,
            job.id,
            job.min_value,
            job.max_value,
            &target_state.to_string(),
            job.attempts,
        );

        Ok(target_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{BatchRange, NewBatchedMigration};
    use crate::store::in_memory::InMemoryMigrationStore;

    async fn setup() -> (JobStateMachine, BatchedJob) {
        let store = Arc::new(InMemoryMigrationStore::new());
        let clock = Arc::new(ManualClock::frozen());
        let migration = store
            .create_migration(
                NewBatchedMigration::new("CopyJob", "Strategy", "events", "id", 1, 100),
                clock.now(),
            )
            .await
            .unwrap();
        let job = store
            .create_job(
                migration.new_job(BatchRange::new(1, 100).unwrap()),
                clock.now(),
            )
            .await
            .unwrap();
        (JobStateMachine::new(store, clock, 2), job)
    }

    #[tokio::test]
    async fn test_run_to_success() {
        let (machine, mut job) = setup().await;

        machine.transition(&mut job, JobEvent::Start).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
        assert!(job.started_at.is_some());

        machine.transition(&mut job, JobEvent::Succeed).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_failures_block_at_max_attempts() {
        let (machine, mut job) = setup().await;

        machine.transition(&mut job, JobEvent::Start).await.unwrap();
        let status = machine
            .transition(&mut job, JobEvent::fail_with_error("timeout"))
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("timeout"));

        machine.transition(&mut job, JobEvent::Start).await.unwrap();
        let status = machine
            .transition(&mut job, JobEvent::fail_with_error("timeout"))
            .await
            .unwrap();
        assert_eq!(status, JobStatus::BlockedByMaxAttempts);

        let result = machine.transition(&mut job, JobEvent::Start).await;
        assert!(matches!(
            result,
            Err(StateMachineError::InvalidTransition { .. })
        ));

        machine
            .transition(&mut job, JobEvent::ResetAttempts)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_blocks_immediately() {
        let (machine, mut job) = setup().await;

        machine.transition(&mut job, JobEvent::Start).await.unwrap();
        let status = machine
            .record_failure(&mut job, &JobFailure::permanent("bad cast"))
            .await
            .unwrap();
        assert_eq!(status, JobStatus::BlockedByMaxAttempts);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_invalid_transitions_rejected() {
        let (machine, mut job) = setup().await;

        assert!(machine.transition(&mut job, JobEvent::Succeed).await.is_err());
        assert!(machine
            .transition(&mut job, JobEvent::ResetAttempts)
            .await
            .is_err());
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_start_guard_rejects_exhausted_failed_job() {
        let (machine, mut job) = setup().await;
        job.status = JobStatus::Failed;
        job.attempts = 2;

        let result = machine.transition(&mut job, JobEvent::Start).await;
        assert!(matches!(result, Err(StateMachineError::GuardFailed { .. })));
        assert_eq!(job.attempts, 2);
    }
}
