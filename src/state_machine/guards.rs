use super::errors::{business_rule_violation, GuardResult};
use super::states::JobStatus;
use crate::models::{BatchedJob, BatchedMigration};
use crate::store::{JobCountQuery, MigrationStore};
use async_trait::async_trait;

/// Trait for implementing state transition guards
#[async_trait]
pub trait StateGuard<T: Sync> {
    /// Check if a transition is allowed
    async fn check(&self, entity: &T, store: &dyn MigrationStore) -> GuardResult<bool>;

    /// Get a description of this guard for logging
    fn description(&self) -> &'static str;
}

/// Guard to check that every batch job succeeded before finishing a migration
pub struct AllJobsSucceededGuard;

#[async_trait]
impl StateGuard<BatchedMigration> for AllJobsSucceededGuard {
    async fn check(
        &self,
        migration: &BatchedMigration,
        store: &dyn MigrationStore,
    ) -> GuardResult<bool> {
        let unsucceeded = store
            .count_jobs(
                migration.id,
                JobCountQuery::default().except_status(JobStatus::Succeeded),
            )
            .await?;

        if unsucceeded > 0 {
            return Err(business_rule_violation(format!(
                "{migration} jobs need to be succeeded ({unsucceeded} remaining)"
            )));
        }

        Ok(true)
    }

    fn description(&self) -> &'static str {
        "All batch jobs must be succeeded"
    }
}

/// Guard to check a job has attempts left before it starts again
pub struct AttemptsRemainingGuard {
    pub max_attempts: i32,
}

#[async_trait]
impl StateGuard<BatchedJob> for AttemptsRemainingGuard {
    async fn check(&self, job: &BatchedJob, _store: &dyn MigrationStore) -> GuardResult<bool> {
        if job.attempts >= self.max_attempts {
            return Err(business_rule_violation(format!(
                "Batched job {} exhausted {} of {} attempts",
                job.id, job.attempts, self.max_attempts
            )));
        }

        Ok(true)
    }

    fn description(&self) -> &'static str {
        "Job must have attempts remaining"
    }
}
