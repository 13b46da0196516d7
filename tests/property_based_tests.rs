mod common;

use batched_migrations::models::{BatchRange, BatchedJob};
use batched_migrations::state_machine::MigrationStatus;
use batched_migrations::store::MigrationStore;
use batched_migrations::test_helpers::TestEngine;
use common::{new_migration, queue_active, runner};
use proptest::prelude::*;

fn finalize_jobs(min_value: i64, span: i64, batch_size: i32) -> (MigrationStatus, Vec<BatchedJob>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let engine = TestEngine::new();
        let runner = runner(&engine);
        let mut migration = queue_active(
            &engine,
            new_migration("NoopJob", min_value, min_value + span, batch_size),
        )
        .await;

        runner.finalize(&mut migration).await.unwrap();
        let jobs = engine.store.jobs_for_migration(migration.id).await.unwrap();
        (migration.status, jobs)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: jobs created from next_min_value partition [min_value, max_value] exactly
    #[test]
    fn job_ranges_partition_the_migration_range(
        min_value in -10_000i64..10_000,
        span in 0i64..2_000,
        batch_size in 5i32..500,
    ) {
        let (status, jobs) = finalize_jobs(min_value, span, batch_size);
        let max_value = min_value + span;

        prop_assert_eq!(status, MigrationStatus::Finished);
        prop_assert!(!jobs.is_empty());
        prop_assert_eq!(jobs.first().map(|job| job.min_value), Some(min_value));
        prop_assert_eq!(jobs.last().map(|job| job.max_value), Some(max_value));

        for pair in jobs.windows(2) {
            prop_assert_eq!(pair[1].min_value, pair[0].max_value + 1);
        }
        for job in &jobs {
            prop_assert!(job.min_value <= job.max_value);
            prop_assert!(job.max_value - job.min_value < i64::from(batch_size));
        }

        let covered: i64 = jobs.iter().map(|job| BatchRange::new(job.min_value, job.max_value).unwrap().len()).sum();
        prop_assert_eq!(covered, span + 1);
    }

    /// Property: sub-batches of a job cover its range in order without overlap
    #[test]
    fn sub_batches_cover_the_job_range(
        min in -1_000i64..1_000,
        len in 1i64..1_000,
        sub_batch_size in 1i32..200,
    ) {
        let context = batched_migrations::registry::JobContext {
            migration_id: 1,
            job_id: 1,
            table_name: "events".to_string(),
            column_name: "id".to_string(),
            range: BatchRange { min, max: min + len - 1 },
            batch_size: len as i32,
            sub_batch_size,
            pause_ms: 0,
            job_arguments: serde_json::json!([]),
        };

        let sub_batches = context.sub_batches();
        prop_assert_eq!(sub_batches.first().map(|r| r.min), Some(min));
        prop_assert_eq!(sub_batches.last().map(|r| r.max), Some(min + len - 1));
        for pair in sub_batches.windows(2) {
            prop_assert_eq!(pair[1].min, pair[0].max + 1);
        }
        prop_assert!(sub_batches.iter().all(|r| r.len() <= i64::from(sub_batch_size)));
    }
}
