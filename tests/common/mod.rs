//! Shared setup for integration tests
#![allow(dead_code)]

use batched_migrations::clock::Clock;
use batched_migrations::execution::BatchedMigrationRunner;
use batched_migrations::models::{BatchRange, BatchedJob, BatchedMigration, NewBatchedMigration};
use batched_migrations::services::MigrationAdmin;
use batched_migrations::state_machine::JobStatus;
use batched_migrations::store::MigrationStore;
use batched_migrations::strategies::PrimaryKeyBatchingStrategy;
use batched_migrations::test_helpers::TestEngine;
use chrono::Duration;

pub fn admin(engine: &TestEngine) -> MigrationAdmin {
    MigrationAdmin::new(
        engine.store.clone(),
        engine.registry.clone(),
        engine.clock.clone(),
        engine.config.clone(),
    )
}

pub fn runner(engine: &TestEngine) -> BatchedMigrationRunner {
    BatchedMigrationRunner::new(
        engine.store.clone(),
        engine.registry.clone(),
        engine.clock.clone(),
        engine.config.clone(),
    )
}

pub fn new_migration(job_class: &str, min: i64, max: i64, batch_size: i32) -> NewBatchedMigration {
    NewBatchedMigration::new(
        job_class,
        PrimaryKeyBatchingStrategy::NAME,
        "events",
        "id",
        min,
        max,
    )
    .with_batch_sizes(batch_size, batch_size.min(10))
    .with_pause_ms(0)
}

/// Queue through the admin surface and resume it
pub async fn queue_active(engine: &TestEngine, migration: NewBatchedMigration) -> BatchedMigration {
    let admin = admin(engine);
    let queued = admin.queue_migration(migration).await.unwrap();
    admin.resume(queued.id).await.unwrap()
}

/// Insert jobs over consecutive ranges of `size`, one per status
pub async fn insert_jobs(
    engine: &TestEngine,
    migration: &BatchedMigration,
    statuses: &[JobStatus],
    size: i64,
) -> Vec<BatchedJob> {
    let mut jobs = Vec::with_capacity(statuses.len());
    for (index, status) in statuses.iter().enumerate() {
        let min = migration.min_value + index as i64 * size;
        let mut job = engine
            .store
            .create_job(
                migration.new_job(BatchRange::new(min, min + size - 1).unwrap()),
                engine.clock.now(),
            )
            .await
            .unwrap();
        job.status = *status;
        engine.store.save_job(&job).await.unwrap();
        jobs.push(job);
    }
    jobs
}

pub fn interval(migration: &BatchedMigration) -> Duration {
    migration.interval()
}
