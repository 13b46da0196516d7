//! # Batched Job Model
//!
//! One bounded unit of work belonging to a [`BatchedMigration`](super::BatchedMigration):
//! an inclusive cursor range plus the sizing it was created with.
//!
//! Maps to `batched_background_migration_jobs`. Jobs are only mutated by their execution
//! result and by the retry/reset operations; they are never deleted while the migration
//! exists.

use super::batch_range::BatchRange;
use crate::state_machine::JobStatus;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct BatchedJob {
    pub id: i64,
    pub batched_migration_id: i64,
    pub min_value: i64,
    pub max_value: i64,
    pub batch_size: i32,
    pub sub_batch_size: i32,
    pub pause_ms: i32,
    pub status: JobStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// New job for insertion. Always created `pending` with zero attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBatchedJob {
    pub batched_migration_id: i64,
    pub min_value: i64,
    pub max_value: i64,
    pub batch_size: i32,
    pub sub_batch_size: i32,
    pub pause_ms: i32,
}

impl BatchedJob {
    pub fn range(&self) -> BatchRange {
        BatchRange {
            min: self.min_value,
            max: self.max_value,
        }
    }

    /// Run time as a fraction of the migration interval.
    ///
    /// Only succeeded jobs with both timestamps have an efficiency.
    pub fn time_efficiency(&self, interval: Duration) -> Option<f64> {
        if self.status != JobStatus::Succeeded {
            return None;
        }
        let (started_at, finished_at) = (self.started_at?, self.finished_at?);
        let interval_ms = interval.num_milliseconds();
        if interval_ms <= 0 {
            return None;
        }

        let duration_ms = (finished_at - started_at).num_milliseconds();
        Some(duration_ms as f64 / interval_ms as f64)
    }

    /// Eligible for another attempt under `max_attempts`
    pub fn is_retriable(&self, max_attempts: i32) -> bool {
        match self.status {
            JobStatus::Pending => true,
            JobStatus::Failed => self.attempts < max_attempts,
            _ => false,
        }
    }

    /// Running but abandoned: not updated since `stuck_before`
    pub fn is_stuck(&self, stuck_before: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.updated_at <= stuck_before
    }
}
