//! # Batched Migration Model
//!
//! The top-level resumable task: a column mutation over the inclusive cursor range
//! `[min_value, max_value]` of one table, executed as a sequence of batch jobs.
//!
//! ## Database Schema
//!
//! Maps to `batched_background_migrations`:
//! ```sql
//! CREATE TABLE batched_background_migrations (
//!   id BIGSERIAL PRIMARY KEY,
//!   job_class_name TEXT NOT NULL,
//!   table_name TEXT NOT NULL,
//!   column_name TEXT NOT NULL,
//!   job_arguments JSONB NOT NULL DEFAULT '[]',
//!   min_value BIGINT NOT NULL,
//!   max_value BIGINT NOT NULL,
//!   status SMALLINT NOT NULL DEFAULT 0,
//!   on_hold_until TIMESTAMPTZ,
//!   -- ... sizing, timing and lease columns
//! );
//! ```
//!
//! `(job_class_name, table_name, column_name, job_arguments)` is unique: two migrations may
//! only touch the same column when their arguments differ.

use super::batch_range::BatchRange;
use super::batched_job::{BatchedJob, NewBatchedJob};
use crate::constants;
use crate::error::{MigrationError, Result};
use crate::state_machine::MigrationStatus;
use crate::store::MigrationStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct BatchedMigration {
    pub id: i64,
    /// Connection scope the migration belongs to
    pub schema_name: String,
    pub job_class_name: String,
    pub batch_class_name: String,
    pub table_name: String,
    pub column_name: String,
    /// Ordered parameter list passed to every job
    pub job_arguments: Value,
    pub min_value: i64,
    pub max_value: i64,
    pub batch_size: i32,
    pub sub_batch_size: i32,
    /// Minimum spacing between two batch jobs
    pub interval_seconds: i64,
    pub pause_ms: i32,
    pub min_batch_size: Option<i32>,
    pub max_batch_size: Option<i32>,
    pub total_tuple_count: Option<i64>,
    pub status: MigrationStatus,
    pub started_at: Option<DateTime<Utc>>,
    /// Start of the failure monitor's sampling window
    pub failure_window_started_at: Option<DateTime<Utc>>,
    pub on_hold_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lookup key matching `for_configuration`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationConfiguration {
    pub schema_name: String,
    pub job_class_name: String,
    pub table_name: String,
    pub column_name: String,
    pub job_arguments: Value,
}

impl MigrationConfiguration {
    pub fn new(
        schema_name: impl Into<String>,
        job_class_name: &str,
        table_name: impl Into<String>,
        column_name: impl Into<String>,
        job_arguments: Value,
    ) -> Self {
        Self {
            schema_name: schema_name.into(),
            job_class_name: normalize_class_name(job_class_name),
            table_name: table_name.into(),
            column_name: column_name.into(),
            job_arguments,
        }
    }

    pub fn matches(&self, migration: &BatchedMigration) -> bool {
        self.schema_name == migration.schema_name
            && self.job_class_name == migration.job_class_name
            && self.table_name == migration.table_name
            && self.column_name == migration.column_name
            && self.job_arguments == migration.job_arguments
    }
}

/// Strip the leading `::` some callers put on fully qualified class names
pub fn normalize_class_name(name: &str) -> String {
    name.trim().trim_start_matches("::").to_string()
}

/// New migration for queueing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBatchedMigration {
    pub schema_name: String,
    pub job_class_name: String,
    pub batch_class_name: String,
    pub table_name: String,
    pub column_name: String,
    pub job_arguments: Value,
    pub min_value: i64,
    pub max_value: i64,
    pub batch_size: i32,
    pub sub_batch_size: i32,
    pub interval_seconds: i64,
    pub pause_ms: i32,
    pub min_batch_size: Option<i32>,
    pub max_batch_size: Option<i32>,
    pub total_tuple_count: Option<i64>,
    pub status: MigrationStatus,
}

impl NewBatchedMigration {
    /// Migration over `[min_value, max_value]` with default sizing, paused
    pub fn new(
        job_class_name: &str,
        batch_class_name: &str,
        table_name: impl Into<String>,
        column_name: impl Into<String>,
        min_value: i64,
        max_value: i64,
    ) -> Self {
        Self {
            schema_name: constants::migration::DEFAULT_SCHEMA.to_string(),
            job_class_name: normalize_class_name(job_class_name),
            batch_class_name: normalize_class_name(batch_class_name),
            table_name: table_name.into(),
            column_name: column_name.into(),
            job_arguments: Value::Array(vec![]),
            min_value,
            max_value,
            batch_size: constants::migration::DEFAULT_BATCH_SIZE,
            sub_batch_size: constants::migration::DEFAULT_SUB_BATCH_SIZE,
            interval_seconds: constants::migration::DEFAULT_INTERVAL_SECONDS,
            pause_ms: constants::migration::DEFAULT_PAUSE_MS,
            min_batch_size: None,
            max_batch_size: None,
            total_tuple_count: None,
            status: MigrationStatus::Paused,
        }
    }

    pub fn with_schema(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = schema_name.into();
        self
    }

    pub fn with_job_arguments(mut self, job_arguments: Value) -> Self {
        self.job_arguments = job_arguments;
        self
    }

    pub fn with_batch_sizes(mut self, batch_size: i32, sub_batch_size: i32) -> Self {
        self.batch_size = batch_size;
        self.sub_batch_size = sub_batch_size;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_seconds = interval.num_seconds();
        self
    }

    pub fn with_pause_ms(mut self, pause_ms: i32) -> Self {
        self.pause_ms = pause_ms;
        self
    }

    pub fn with_batch_size_bounds(mut self, min: Option<i32>, max: Option<i32>) -> Self {
        self.min_batch_size = min;
        self.max_batch_size = max;
        self
    }

    pub fn with_total_tuple_count(mut self, total: i64) -> Self {
        self.total_tuple_count = Some(total);
        self
    }

    pub fn with_status(mut self, status: MigrationStatus) -> Self {
        self.status = status;
        self
    }

    pub fn configuration(&self) -> MigrationConfiguration {
        MigrationConfiguration::new(
            self.schema_name.clone(),
            &self.job_class_name,
            self.table_name.clone(),
            self.column_name.clone(),
            self.job_arguments.clone(),
        )
    }

    /// Field-level validation; uniqueness is checked by the store
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(MigrationError::ValidationError(msg));

        if self.job_class_name.is_empty() || self.batch_class_name.is_empty() {
            return invalid("job_class_name and batch_class_name are required".to_string());
        }
        if self.table_name.is_empty() || self.column_name.is_empty() {
            return invalid("table_name and column_name are required".to_string());
        }
        if !self.job_arguments.is_array() {
            return invalid(format!(
                "job_arguments must be an array, got {}",
                self.job_arguments
            ));
        }
        if self.min_value > self.max_value {
            return invalid(format!(
                "min_value {} is greater than max_value {}",
                self.min_value, self.max_value
            ));
        }
        if self.batch_size < 1 || self.sub_batch_size < 1 {
            return invalid("batch_size and sub_batch_size must be positive".to_string());
        }
        if self.sub_batch_size > self.batch_size {
            return invalid(format!(
                "sub_batch_size {} exceeds batch_size {}",
                self.sub_batch_size, self.batch_size
            ));
        }
        if self.interval_seconds < 0 || self.pause_ms < 0 {
            return invalid("interval and pause_ms must not be negative".to_string());
        }
        if let (Some(min), Some(max)) = (self.min_batch_size, self.max_batch_size) {
            if min > max {
                return invalid(format!(
                    "min_batch_size {min} is greater than max_batch_size {max}"
                ));
            }
        }
        Ok(())
    }
}

impl BatchedMigration {
    pub fn interval(&self) -> Duration {
        Duration::seconds(self.interval_seconds)
    }

    /// First cursor value not yet covered by a batch job
    ///
    /// `None` once the last job ends at `i64::MAX` and no value is left to start from.
    pub fn next_min_value(&self, last_job: Option<&BatchedJob>) -> Option<i64> {
        match last_job {
            Some(job) => job.max_value.checked_add(1),
            None => Some(self.min_value),
        }
    }

    /// Pacing gate: has at least `interval - variance` passed since the last job was created
    pub fn interval_elapsed(
        &self,
        last_job: Option<&BatchedJob>,
        now: DateTime<Utc>,
        variance: Duration,
    ) -> bool {
        match last_job {
            None => true,
            Some(job) => job.created_at <= now - (self.interval() - variance),
        }
    }

    /// A hold covers its end instant; dispatch resumes strictly after `on_hold_until`
    pub fn is_on_hold(&self, now: DateTime<Utc>) -> bool {
        self.on_hold_until.is_some_and(|until| until >= now)
    }

    /// Active and not on hold
    pub fn is_executable(&self, now: DateTime<Utc>) -> bool {
        self.status == MigrationStatus::Active && !self.is_on_hold(now)
    }

    /// Suspend dispatch until `until_time` without touching status
    pub fn hold(&mut self, until_time: DateTime<Utc>, now: DateTime<Utc>) {
        let duration_s = (until_time - now).num_seconds();
        info!(
            migration_id = self.id,
            job_class_name = %self.job_class_name,
            duration_s = duration_s,
            "{} put on hold until {}",
            self,
            until_time
        );

        self.on_hold_until = Some(until_time);
        self.updated_at = now;
    }

    /// Job covering `range` with the current sizing configuration
    pub fn new_job(&self, range: BatchRange) -> NewBatchedJob {
        NewBatchedJob {
            batched_migration_id: self.id,
            min_value: range.min,
            max_value: range.max,
            batch_size: self.batch_size,
            sub_batch_size: self.sub_batch_size,
            pause_ms: self.pause_ms,
        }
    }

    /// `JobClass/table.column`
    pub fn identifier(&self) -> String {
        format!(
            "{}/{}.{}",
            self.job_class_name, self.table_name, self.column_name
        )
    }

    pub fn configuration(&self) -> MigrationConfiguration {
        MigrationConfiguration::new(
            self.schema_name.clone(),
            &self.job_class_name,
            self.table_name.clone(),
            self.column_name.clone(),
            self.job_arguments.clone(),
        )
    }

    /// Percentage of `total_tuple_count` already migrated, capped at 100
    pub fn progress_percentage(&self, migrated_tuple_count: i64) -> Option<f64> {
        let total = self.total_tuple_count.filter(|total| *total > 0)?;
        let percentage = (migrated_tuple_count as f64 / total as f64) * 100.0;
        Some(percentage.min(100.0))
    }

    /// Remaining batches at the current batch size times the interval
    pub fn estimated_time_remaining(&self, migrated_tuple_count: i64) -> Option<Duration> {
        let total = self.total_tuple_count?;
        let remaining = (total - migrated_tuple_count).max(0);
        let batch_size = i64::from(self.batch_size.max(1));
        let batches = (remaining + batch_size - 1) / batch_size;
        Some(self.interval() * batches as i32)
    }

    pub async fn last_job(&self, store: &dyn MigrationStore) -> Result<Option<BatchedJob>> {
        store.last_job(self.id).await
    }

    /// Persist a pending job over `[min, max]` using the current sizing configuration
    pub async fn create_batched_job(
        &self,
        store: &dyn MigrationStore,
        min: i64,
        max: i64,
        now: DateTime<Utc>,
    ) -> Result<BatchedJob> {
        let range = BatchRange::new(min, max)?;
        store.create_job(self.new_job(range), now).await
    }

    /// Rows covered by succeeded jobs
    pub async fn migrated_tuple_count(&self, store: &dyn MigrationStore) -> Result<i64> {
        let counts = store.successful_rows_counts(&[self.id]).await?;
        Ok(counts.get(&self.id).copied().unwrap_or(0))
    }
}

impl fmt::Display for BatchedMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BatchedMigration[id: {}]", self.id)
    }
}
