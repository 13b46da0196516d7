use super::{
    errors::{StateMachineError, StateMachineResult},
    events::MigrationEvent,
    guards::{AllJobsSucceededGuard, StateGuard},
    states::MigrationStatus,
};
use crate::clock::Clock;
use crate::error::MigrationError;
use crate::logging::log_migration_operation;
use crate::models::BatchedMigration;
use crate::store::MigrationStore;
use std::sync::Arc;
use tracing::{instrument, warn};

/// Status lifecycle for batched migrations.
///
/// Every event is accepted from every state; the `finish` transition is guarded by
/// [`AllJobsSucceededGuard`]. Entering `active` for the first time stamps `started_at`.
pub struct MigrationStateMachine {
    store: Arc<dyn MigrationStore>,
    clock: Arc<dyn Clock>,
}

impl MigrationStateMachine {
    pub fn new(store: Arc<dyn MigrationStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Target of `event`; the table is total over all five states
    pub fn determine_target_state(
        _current_state: MigrationStatus,
        event: MigrationEvent,
    ) -> MigrationStatus {
        match event {
            MigrationEvent::Pause => MigrationStatus::Paused,
            MigrationEvent::Execute => MigrationStatus::Active,
            MigrationEvent::Finish => MigrationStatus::Finished,
            MigrationEvent::Failure => MigrationStatus::Failed,
            MigrationEvent::Finalize => MigrationStatus::Finalizing,
        }
    }

    /// Apply `event` to `migration` and persist it
    #[instrument(skip(self, migration), fields(migration_id = migration.id))]
    pub async fn transition(
        &self,
        migration: &mut BatchedMigration,
        event: MigrationEvent,
    ) -> StateMachineResult<MigrationStatus> {
        let current_state = migration.status;
        let target_state = Self::determine_target_state(current_state, event);

        self.check_guards(migration, current_state, target_state)
            .await?;

        let now = self.clock.now();
        let mut updated = migration.clone();
        updated.status = target_state;
        updated.updated_at = now;
        if target_state == MigrationStatus::Active {
            let started_at = *updated.started_at.get_or_insert(now);
            updated.failure_window_started_at.get_or_insert(started_at);
        }

        if !self
            .store
            .update_migration_status(&updated, current_state)
            .await?
        {
            return Err(self.status_changed(migration, current_state).await);
        }
        *migration = updated;

        log_migration_operation(
            event.event_type(),
            migration.id,
            &migration.job_class_name,
            &target_state.to_string(),
            Some(&format!("from {current_state}")),
        );

        Ok(target_state)
    }

    /// Reload `migration` after losing a status race and describe the conflict
    async fn status_changed(
        &self,
        migration: &mut BatchedMigration,
        expected: MigrationStatus,
    ) -> StateMachineError {
        let stored = match self.store.find_migration(migration.id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return MigrationError::migration_not_found(migration.id).into(),
            Err(err) => return err.into(),
        };

        warn!(
            migration_id = migration.id,
            expected = %expected,
            actual = %stored.status,
            "Migration status changed concurrently, transition skipped"
        );
        let actual = stored.status;
        *migration = stored;
        StateMachineError::StatusChanged {
            migration_id: migration.id,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    async fn check_guards(
        &self,
        migration: &BatchedMigration,
        current_state: MigrationStatus,
        target_state: MigrationStatus,
    ) -> StateMachineResult<()> {
        match (current_state, target_state) {
            (MigrationStatus::Finished, MigrationStatus::Finished) => {}
            (_, MigrationStatus::Finished) => {
                AllJobsSucceededGuard
                    .check(migration, self.store.as_ref())
                    .await?;
            }
            _ => {}
        }

        Ok(())
    }
}
