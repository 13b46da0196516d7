//! Contracts for the two pluggable collaborators of a migration: the job class that mutates
//! one range, and the batching strategy that decides where the next range ends.

use crate::error::{JobFailure, Result};
use crate::models::{BatchRange, BatchedJob, BatchedMigration};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Everything a job class needs to process one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobContext {
    pub migration_id: i64,
    pub job_id: i64,
    pub table_name: String,
    pub column_name: String,
    pub range: BatchRange,
    pub batch_size: i32,
    pub sub_batch_size: i32,
    pub pause_ms: i32,
    pub job_arguments: Value,
}

impl JobContext {
    /// Context for `job`; sizing comes from the job, not the migration
    pub fn for_job(migration: &BatchedMigration, job: &BatchedJob) -> Self {
        Self {
            migration_id: migration.id,
            job_id: job.id,
            table_name: migration.table_name.clone(),
            column_name: migration.column_name.clone(),
            range: job.range(),
            batch_size: job.batch_size,
            sub_batch_size: job.sub_batch_size,
            pause_ms: job.pause_ms,
            job_arguments: migration.job_arguments.clone(),
        }
    }

    /// Split the job range into consecutive chunks of at most `sub_batch_size` values
    pub fn sub_batches(&self) -> Vec<BatchRange> {
        let step = i64::from(self.sub_batch_size.max(1));
        let mut ranges = Vec::new();
        let mut min = self.range.min;

        while min <= self.range.max {
            let max = min.saturating_add(step - 1).min(self.range.max);
            ranges.push(BatchRange { min, max });
            if max == i64::MAX {
                break;
            }
            min = max + 1;
        }

        ranges
    }

    pub fn pause_duration(&self) -> Duration {
        Duration::from_millis(u64::try_from(self.pause_ms).unwrap_or(0))
    }

    /// Run `operation` over every sub-batch, sleeping `pause_ms` between them
    pub async fn each_sub_batch<F, Fut>(&self, mut operation: F) -> std::result::Result<(), JobFailure>
    where
        F: FnMut(BatchRange) -> Fut,
        Fut: Future<Output = std::result::Result<(), JobFailure>>,
    {
        for (index, sub_batch) in self.sub_batches().into_iter().enumerate() {
            if index > 0 && self.pause_ms > 0 {
                tokio::time::sleep(self.pause_duration()).await;
            }
            operation(sub_batch).await?;
        }
        Ok(())
    }
}

/// Performs the data mutation for one range. Must be idempotent over its range.
#[async_trait]
pub trait BatchedJobHandler: Send + Sync {
    /// Registered class name
    fn name(&self) -> &str;

    async fn perform(&self, context: &JobContext) -> std::result::Result<(), JobFailure>;
}

/// Input to a batching strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub table_name: String,
    pub column_name: String,
    pub job_class_name: String,
    pub job_arguments: Value,
    /// Where the next batch must start
    pub batch_min_value: i64,
    pub batch_size: i32,
    /// Upper bound of the migration
    pub max_value: i64,
}

impl BatchRequest {
    pub fn for_migration(migration: &BatchedMigration, batch_min_value: i64, batch_size: i32) -> Self {
        Self {
            table_name: migration.table_name.clone(),
            column_name: migration.column_name.clone(),
            job_class_name: migration.job_class_name.clone(),
            job_arguments: migration.job_arguments.clone(),
            batch_min_value,
            batch_size,
            max_value: migration.max_value,
        }
    }
}

/// Computes the next range to process, or `None` when there is no more work.
///
/// Returned ranges must start at `batch_min_value` for coverage to stay contiguous.
#[async_trait]
pub trait BatchingStrategy: Send + Sync {
    /// Registered class name
    fn name(&self) -> &str;

    async fn next_batch(&self, request: &BatchRequest) -> Result<Option<BatchRange>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::batched_job::test_support::job;
    use crate::models::batched_migration::test_support::migration;
    use parking_lot::Mutex;

    fn context(min: i64, max: i64, sub_batch_size: i32) -> JobContext {
        let mut job = job(5, 1, min, max);
        job.sub_batch_size = sub_batch_size;
        job.pause_ms = 0;
        JobContext::for_job(&migration(1), &job)
    }

    #[test]
    fn test_sub_batches_cover_range() {
        let ranges = context(1, 25, 10).sub_batches();
        assert_eq!(
            ranges,
            vec![
                BatchRange { min: 1, max: 10 },
                BatchRange { min: 11, max: 20 },
                BatchRange { min: 21, max: 25 },
            ]
        );
    }

    #[test]
    fn test_sub_batches_single_value() {
        assert_eq!(
            context(7, 7, 100).sub_batches(),
            vec![BatchRange { min: 7, max: 7 }]
        );
    }

    #[tokio::test]
    async fn test_each_sub_batch_stops_on_failure() {
        let seen = Mutex::new(Vec::new());
        let result = context(1, 30, 10)
            .each_sub_batch(|range| {
                seen.lock().push(range.min);
                async move {
                    if range.min == 11 {
                        Err(JobFailure::retryable("lock timeout"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert_eq!(result, Err(JobFailure::retryable("lock timeout")));
        assert_eq!(*seen.lock(), vec![1, 11]);
    }
}
