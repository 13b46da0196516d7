use crate::error::{MigrationError, Result};
use crate::models::BatchRange;
use crate::registry::{BatchRequest, BatchingStrategy};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

/// Dense key ranges: `[start, start + batch_size - 1]`, capped at the migration's upper
/// bound. Suitable when keys have no large gaps.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrimaryKeyBatchingStrategy;

impl PrimaryKeyBatchingStrategy {
    pub const NAME: &'static str = "PrimaryKeyBatchingStrategy";
}

#[async_trait]
impl BatchingStrategy for PrimaryKeyBatchingStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn next_batch(&self, request: &BatchRequest) -> Result<Option<BatchRange>> {
        if request.batch_size < 1 {
            return Err(MigrationError::StrategyError(format!(
                "batch_size must be positive, got {}",
                request.batch_size
            )));
        }
        if request.batch_min_value > request.max_value {
            return Ok(None);
        }

        let max = request
            .batch_min_value
            .saturating_add(i64::from(request.batch_size) - 1)
            .min(request.max_value);

        Ok(Some(BatchRange {
            min: request.batch_min_value,
            max,
        }))
    }
}

/// Key ranges over the rows that actually exist, read from PostgreSQL.
///
/// The batch spans the next `batch_size` key values at or after the start. When rows exist
/// the range still starts at the requested value, so coverage stays gap free.
#[derive(Debug, Clone)]
pub struct PgPrimaryKeyBatchingStrategy {
    pool: PgPool,
}

impl PgPrimaryKeyBatchingStrategy {
    pub const NAME: &'static str = "PgPrimaryKeyBatchingStrategy";

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchingStrategy for PgPrimaryKeyBatchingStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn next_batch(&self, request: &BatchRequest) -> Result<Option<BatchRange>> {
        if request.batch_min_value > request.max_value {
            return Ok(None);
        }

        let table = quote_identifier(&request.table_name)?;
        let column = quote_identifier(&request.column_name)?;
        let query = format!(
            "SELECT MAX(batch.key)::BIGINT FROM ( \
                SELECT {column} AS key FROM {table} \
                WHERE {column} >= $1 AND {column} <= $2 \
                ORDER BY {column} LIMIT $3 \
             ) batch"
        );

        let upper: Option<i64> = sqlx::query_scalar(&query)
            .bind(request.batch_min_value)
            .bind(request.max_value)
            .bind(i64::from(request.batch_size))
            .fetch_one(&self.pool)
            .await?;

        debug!(
            table = %request.table_name,
            batch_min_value = request.batch_min_value,
            ?upper,
            "Computed next batch bounds"
        );

        Ok(upper.map(|max| BatchRange {
            min: request.batch_min_value,
            max,
        }))
    }
}

/// Quote a possibly schema-qualified identifier, rejecting anything unusual
fn quote_identifier(identifier: &str) -> Result<String> {
    let parts: Vec<&str> = identifier.split('.').collect();
    if parts.is_empty() || parts.len() > 2 {
        return Err(MigrationError::StrategyError(format!(
            "Invalid identifier '{identifier}'"
        )));
    }

    let mut quoted = Vec::with_capacity(parts.len());
    for part in parts {
        let valid = part
            .chars()
            .next()
            .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(MigrationError::StrategyError(format!(
                "Invalid identifier '{identifier}'"
            )));
        }
        quoted.push(format!("\"{part}\""));
    }

    Ok(quoted.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(batch_min_value: i64, batch_size: i32, max_value: i64) -> BatchRequest {
        BatchRequest {
            table_name: "events".to_string(),
            column_name: "id".to_string(),
            job_class_name: "CopyJob".to_string(),
            job_arguments: json!([]),
            batch_min_value,
            batch_size,
            max_value,
        }
    }

    #[tokio::test]
    async fn test_dense_ranges() {
        let strategy = PrimaryKeyBatchingStrategy;

        let range = strategy.next_batch(&request(1, 100, 1_000)).await.unwrap();
        assert_eq!(range, Some(BatchRange { min: 1, max: 100 }));

        let range = strategy.next_batch(&request(951, 100, 1_000)).await.unwrap();
        assert_eq!(range, Some(BatchRange { min: 951, max: 1_000 }));

        let range = strategy.next_batch(&request(1_001, 100, 1_000)).await.unwrap();
        assert_eq!(range, None);
    }

    #[tokio::test]
    async fn test_invalid_batch_size() {
        let strategy = PrimaryKeyBatchingStrategy;
        assert!(strategy.next_batch(&request(1, 0, 10)).await.is_err());
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("events").unwrap(), "\"events\"");
        assert_eq!(
            quote_identifier("public.events").unwrap(),
            "\"public\".\"events\""
        );
        assert!(quote_identifier("events; DROP TABLE users").is_err());
        assert!(quote_identifier("a.b.c").is_err());
        assert!(quote_identifier("1events").is_err());
        assert!(quote_identifier("").is_err());
    }
}
