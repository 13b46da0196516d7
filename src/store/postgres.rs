//! # PostgreSQL Store
//!
//! [`MigrationStore`] over `batched_background_migrations` and
//! `batched_background_migration_jobs` (schema in `migrations/`).
//!
//! Selection for dispatch goes through [`claim_active_migration`], which leases the oldest
//! executable migration with `FOR UPDATE SKIP LOCKED` so concurrent executors never pick
//! the same row.
//!
//! [`claim_active_migration`]: MigrationStore::claim_active_migration

use super::{JobCountQuery, JobPage, MigrationStore};
use crate::config::DatabaseConfig;
use crate::error::{MigrationError, Result};
use crate::models::{
    BatchedJob, BatchedMigration, MigrationConfiguration, NewBatchedJob, NewBatchedMigration,
};
use crate::state_machine::{JobStatus, MigrationStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::{debug, info, instrument};

const MIGRATION_COLUMNS: &str = "id, schema_name, job_class_name, batch_class_name, \
    table_name, column_name, job_arguments, min_value, max_value, batch_size, sub_batch_size, \
    interval_seconds, pause_ms, min_batch_size, max_batch_size, total_tuple_count, status, \
    started_at, failure_window_started_at, on_hold_until, created_at, updated_at";

const JOB_COLUMNS: &str = "id, batched_migration_id, min_value, max_value, batch_size, \
    sub_batch_size, pause_ms, status, attempts, last_error, created_at, started_at, \
    finished_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgMigrationStore {
    pool: PgPool,
}

impl PgMigrationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from configuration
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        info!(max_connections = config.max_connections, "Connected migration store");
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| MigrationError::DatabaseError(format!("Schema migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_unique_violation(error: sqlx::Error, migration: &NewBatchedMigration) -> MigrationError {
    match &error {
        sqlx::Error::Database(db_error) if db_error.is_unique_violation() => {
            MigrationError::DuplicateMigration {
                job_class_name: migration.job_class_name.clone(),
                table_name: migration.table_name.clone(),
                column_name: migration.column_name.clone(),
                job_arguments: migration.job_arguments.to_string(),
            }
        }
        _ => error.into(),
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl MigrationStore for PgMigrationStore {
    #[instrument(skip(self, migration), fields(job_class_name = %migration.job_class_name))]
    async fn create_migration(
        &self,
        migration: NewBatchedMigration,
        now: DateTime<Utc>,
    ) -> Result<BatchedMigration> {
        migration.validate()?;

        let sql = format!(
            r#"
            INSERT INTO batched_background_migrations (
                schema_name, job_class_name, batch_class_name, table_name, column_name,
                job_arguments, min_value, max_value, batch_size, sub_batch_size,
                interval_seconds, pause_ms, min_batch_size, max_batch_size, total_tuple_count,
                status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $17)
            RETURNING {MIGRATION_COLUMNS}
            "#
        );

        sqlx::query_as::<_, BatchedMigration>(&sql)
            .bind(&migration.schema_name)
            .bind(&migration.job_class_name)
            .bind(&migration.batch_class_name)
            .bind(&migration.table_name)
            .bind(&migration.column_name)
            .bind(&migration.job_arguments)
            .bind(migration.min_value)
            .bind(migration.max_value)
            .bind(migration.batch_size)
            .bind(migration.sub_batch_size)
            .bind(migration.interval_seconds)
            .bind(migration.pause_ms)
            .bind(migration.min_batch_size)
            .bind(migration.max_batch_size)
            .bind(migration.total_tuple_count)
            .bind(migration.status)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_unique_violation(e, &migration))
    }

    async fn find_migration(&self, id: i64) -> Result<Option<BatchedMigration>> {
        let sql =
            format!("SELECT {MIGRATION_COLUMNS} FROM batched_background_migrations WHERE id = $1");
        Ok(sqlx::query_as::<_, BatchedMigration>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_for_configuration(
        &self,
        configuration: &MigrationConfiguration,
    ) -> Result<Option<BatchedMigration>> {
        let sql = format!(
            r#"
            SELECT {MIGRATION_COLUMNS}
            FROM batched_background_migrations
            WHERE schema_name = $1
              AND job_class_name = $2
              AND table_name = $3
              AND column_name = $4
              AND job_arguments = $5
            ORDER BY id
            LIMIT 1
            "#
        );
        Ok(sqlx::query_as::<_, BatchedMigration>(&sql)
            .bind(&configuration.schema_name)
            .bind(&configuration.job_class_name)
            .bind(&configuration.table_name)
            .bind(&configuration.column_name)
            .bind(&configuration.job_arguments)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_migrations(&self, schema: Option<&str>) -> Result<Vec<BatchedMigration>> {
        let sql = format!(
            r#"
            SELECT {MIGRATION_COLUMNS}
            FROM batched_background_migrations
            WHERE ($1::TEXT IS NULL OR schema_name = $1)
            ORDER BY id
            "#
        );
        Ok(sqlx::query_as::<_, BatchedMigration>(&sql)
            .bind(schema)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn queued(&self, schema: &str) -> Result<Vec<BatchedMigration>> {
        let sql = format!(
            r#"
            SELECT {MIGRATION_COLUMNS}
            FROM batched_background_migrations
            WHERE schema_name = $1 AND status = ANY($2)
            ORDER BY id
            "#
        );
        let statuses = vec![MigrationStatus::Active as i16, MigrationStatus::Paused as i16];
        Ok(sqlx::query_as::<_, BatchedMigration>(&sql)
            .bind(schema)
            .bind(statuses)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn save_migration(&self, migration: &BatchedMigration) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE batched_background_migrations
            SET batch_size = $2,
                sub_batch_size = $3,
                interval_seconds = $4,
                pause_ms = $5,
                min_batch_size = $6,
                max_batch_size = $7,
                total_tuple_count = $8,
                status = $9,
                started_at = $10,
                failure_window_started_at = $11,
                on_hold_until = $12,
                updated_at = $13
            WHERE id = $1
            "#,
        )
        .bind(migration.id)
        .bind(migration.batch_size)
        .bind(migration.sub_batch_size)
        .bind(migration.interval_seconds)
        .bind(migration.pause_ms)
        .bind(migration.min_batch_size)
        .bind(migration.max_batch_size)
        .bind(migration.total_tuple_count)
        .bind(migration.status)
        .bind(migration.started_at)
        .bind(migration.failure_window_started_at)
        .bind(migration.on_hold_until)
        .bind(migration.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MigrationError::migration_not_found(migration.id));
        }
        Ok(())
    }

    async fn update_migration_status(
        &self,
        migration: &BatchedMigration,
        expected: MigrationStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batched_background_migrations
            SET status = $3,
                started_at = $4,
                failure_window_started_at = $5,
                updated_at = $6
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(migration.id)
        .bind(expected)
        .bind(migration.status)
        .bind(migration.started_at)
        .bind(migration.failure_window_started_at)
        .bind(migration.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.find_migration(migration.id).await? {
            Some(_) => Ok(false),
            None => Err(MigrationError::migration_not_found(migration.id)),
        }
    }

    async fn update_batch_sizes(
        &self,
        migration_id: i64,
        batch_size: i32,
        sub_batch_size: i32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE batched_background_migrations
            SET batch_size = $2, sub_batch_size = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(migration_id)
        .bind(batch_size)
        .bind(sub_batch_size)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MigrationError::migration_not_found(migration_id));
        }
        Ok(())
    }

    async fn update_hold(
        &self,
        migration_id: i64,
        on_hold_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE batched_background_migrations
            SET on_hold_until = $2, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(migration_id)
        .bind(on_hold_until)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MigrationError::migration_not_found(migration_id));
        }
        Ok(())
    }

    async fn active_migration(
        &self,
        schema: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchedMigration>> {
        let sql = format!(
            r#"
            SELECT {MIGRATION_COLUMNS}
            FROM batched_background_migrations
            WHERE schema_name = $1
              AND status = $2
              AND (on_hold_until IS NULL OR on_hold_until < $3)
            ORDER BY id
            LIMIT 1
            "#
        );
        Ok(sqlx::query_as::<_, BatchedMigration>(&sql)
            .bind(schema)
            .bind(MigrationStatus::Active)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?)
    }

    #[instrument(skip(self))]
    async fn claim_active_migration(
        &self,
        schema: &str,
        executor_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchedMigration>> {
        let sql = format!(
            r#"
            UPDATE batched_background_migrations
            SET locked_by = $2, locked_until = $3
            WHERE id = (
                SELECT id
                FROM batched_background_migrations
                WHERE schema_name = $1
                  AND status = $4
                  AND (on_hold_until IS NULL OR on_hold_until < $5)
                  AND (locked_by IS NULL OR locked_until IS NULL
                       OR locked_until <= $5 OR locked_by = $2)
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {MIGRATION_COLUMNS}
            "#
        );

        let claimed = sqlx::query_as::<_, BatchedMigration>(&sql)
            .bind(schema)
            .bind(executor_id)
            .bind(now + lease)
            .bind(MigrationStatus::Active)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(migration) = &claimed {
            debug!(migration_id = migration.id, executor_id, "Claimed migration lease");
        }
        Ok(claimed)
    }

    async fn release_migration(&self, migration_id: i64, executor_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE batched_background_migrations
            SET locked_by = NULL, locked_until = NULL
            WHERE id = $1 AND locked_by = $2
            "#,
        )
        .bind(migration_id)
        .bind(executor_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_job(&self, job: NewBatchedJob, now: DateTime<Utc>) -> Result<BatchedJob> {
        let sql = format!(
            r#"
            INSERT INTO batched_background_migration_jobs (
                batched_migration_id, min_value, max_value, batch_size, sub_batch_size,
                pause_ms, status, attempts, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, $8)
            RETURNING {JOB_COLUMNS}
            "#
        );
        Ok(sqlx::query_as::<_, BatchedJob>(&sql)
            .bind(job.batched_migration_id)
            .bind(job.min_value)
            .bind(job.max_value)
            .bind(job.batch_size)
            .bind(job.sub_batch_size)
            .bind(job.pause_ms)
            .bind(JobStatus::Pending)
            .bind(now)
            .fetch_one(&self.pool)
            .await?)
    }

    async fn find_job(&self, id: i64) -> Result<Option<BatchedJob>> {
        let sql =
            format!("SELECT {JOB_COLUMNS} FROM batched_background_migration_jobs WHERE id = $1");
        Ok(sqlx::query_as::<_, BatchedJob>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn save_job(&self, job: &BatchedJob) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE batched_background_migration_jobs
            SET min_value = $2,
                max_value = $3,
                batch_size = $4,
                sub_batch_size = $5,
                pause_ms = $6,
                status = $7,
                attempts = $8,
                last_error = $9,
                started_at = $10,
                finished_at = $11,
                updated_at = $12
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.min_value)
        .bind(job.max_value)
        .bind(job.batch_size)
        .bind(job.sub_batch_size)
        .bind(job.pause_ms)
        .bind(job.status)
        .bind(job.attempts)
        .bind(&job.last_error)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MigrationError::job_not_found(job.id));
        }
        Ok(())
    }

    async fn last_job(&self, migration_id: i64) -> Result<Option<BatchedJob>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM batched_background_migration_jobs
            WHERE batched_migration_id = $1
            ORDER BY max_value DESC, id DESC
            LIMIT 1
            "#
        );
        Ok(sqlx::query_as::<_, BatchedJob>(&sql)
            .bind(migration_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn jobs_for_migration(&self, migration_id: i64) -> Result<Vec<BatchedJob>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM batched_background_migration_jobs
            WHERE batched_migration_id = $1
            ORDER BY min_value, id
            "#
        );
        Ok(sqlx::query_as::<_, BatchedJob>(&sql)
            .bind(migration_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn jobs_with_status(&self, migration_id: i64, page: JobPage) -> Result<Vec<BatchedJob>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM batched_background_migration_jobs
            WHERE batched_migration_id = $1
              AND status = $2
              AND id > $3
              AND id <= $4
            ORDER BY id
            LIMIT $5
            "#
        );
        Ok(sqlx::query_as::<_, BatchedJob>(&sql)
            .bind(migration_id)
            .bind(page.status)
            .bind(page.after_id)
            .bind(page.until_id)
            .bind(limit_param(page.limit))
            .fetch_all(&self.pool)
            .await?)
    }

    async fn first_retriable_job(
        &self,
        migration_id: i64,
        max_attempts: i32,
        stuck_before: DateTime<Utc>,
    ) -> Result<Option<BatchedJob>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM batched_background_migration_jobs
            WHERE batched_migration_id = $1
              AND (status = $2
                   OR (status = $3 AND attempts < $4)
                   OR (status = $5 AND updated_at <= $6))
            ORDER BY min_value, id
            LIMIT 1
            "#
        );
        Ok(sqlx::query_as::<_, BatchedJob>(&sql)
            .bind(migration_id)
            .bind(JobStatus::Pending)
            .bind(JobStatus::Failed)
            .bind(max_attempts)
            .bind(JobStatus::Running)
            .bind(stuck_before)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn count_jobs(&self, migration_id: i64, query: JobCountQuery) -> Result<i64> {
        let statuses: Vec<i16> = query.statuses.iter().map(|status| *status as i16).collect();
        let except_status = query.except_status.map(|status| status as i16);

        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM batched_background_migration_jobs
            WHERE batched_migration_id = $1
              AND (cardinality($2::SMALLINT[]) = 0 OR status = ANY($2))
              AND ($3::SMALLINT IS NULL OR status <> $3)
              AND ($4::TIMESTAMPTZ IS NULL OR created_at >= $4)
            "#,
        )
        .bind(migration_id)
        .bind(statuses)
        .bind(except_status)
        .bind(query.created_since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn recent_successful_jobs(
        &self,
        migration_id: i64,
        limit: usize,
    ) -> Result<Vec<BatchedJob>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM batched_background_migration_jobs
            WHERE batched_migration_id = $1 AND status = $2
            ORDER BY finished_at DESC NULLS LAST, id DESC
            LIMIT $3
            "#
        );
        Ok(sqlx::query_as::<_, BatchedJob>(&sql)
            .bind(migration_id)
            .bind(JobStatus::Succeeded)
            .bind(limit_param(limit))
            .fetch_all(&self.pool)
            .await?)
    }

    async fn successful_rows_counts(&self, migration_ids: &[i64]) -> Result<HashMap<i64, i64>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT batched_migration_id, SUM(batch_size)::BIGINT
            FROM batched_background_migration_jobs
            WHERE batched_migration_id = ANY($1) AND status = $2
            GROUP BY batched_migration_id
            "#,
        )
        .bind(migration_ids)
        .bind(JobStatus::Succeeded)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn max_job_id(&self, migration_id: i64) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(id) FROM batched_background_migration_jobs WHERE batched_migration_id = $1",
        )
        .bind(migration_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(max.unwrap_or(0))
    }

    #[instrument(skip(self, job, sibling), fields(job_id = job.id))]
    async fn split_job(
        &self,
        job: &BatchedJob,
        sibling: NewBatchedJob,
        now: DateTime<Utc>,
    ) -> Result<BatchedJob> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE batched_background_migration_jobs
            SET min_value = $2, max_value = $3, batch_size = $4, sub_batch_size = $5,
                attempts = $6, status = $7, updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.min_value)
        .bind(job.max_value)
        .bind(job.batch_size)
        .bind(job.sub_batch_size)
        .bind(job.attempts)
        .bind(job.status)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(MigrationError::job_not_found(job.id));
        }

        let sql = format!(
            r#"
            INSERT INTO batched_background_migration_jobs (
                batched_migration_id, min_value, max_value, batch_size, sub_batch_size,
                pause_ms, status, attempts, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, $8)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let created = sqlx::query_as::<_, BatchedJob>(&sql)
            .bind(sibling.batched_migration_id)
            .bind(sibling.min_value)
            .bind(sibling.max_value)
            .bind(sibling.batch_size)
            .bind(sibling.sub_batch_size)
            .bind(sibling.pause_ms)
            .bind(JobStatus::Failed)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(created)
    }
}
