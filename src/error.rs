//! Error types for the batched migration engine.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error(
        "Duplicate migration: {job_class_name} on {table_name}.{column_name} with arguments {job_arguments}"
    )]
    DuplicateMigration {
        job_class_name: String,
        table_name: String,
        column_name: String,
        job_arguments: String,
    },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
    #[error("Migration {migration_id} status is {actual}, expected {expected}")]
    StatusConflict {
        migration_id: i64,
        expected: String,
        actual: String,
    },
    #[error("Guard failed: {0}")]
    GuardFailed(String),
    #[error("Registry error: {0}")]
    RegistryError(String),
    #[error("Batching strategy error: {0}")]
    StrategyError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MigrationError {
    pub fn migration_not_found(id: i64) -> Self {
        Self::NotFound {
            entity: "BatchedMigration",
            id,
        }
    }

    pub fn job_not_found(id: i64) -> Self {
        Self::NotFound {
            entity: "BatchedJob",
            id,
        }
    }
}

impl From<sqlx::Error> for MigrationError {
    fn from(err: sqlx::Error) -> Self {
        MigrationError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for MigrationError {
    fn from(error: serde_json::Error) -> Self {
        MigrationError::ValidationError(format!("JSON serialization error: {error}"))
    }
}

impl From<config::ConfigError> for MigrationError {
    fn from(error: config::ConfigError) -> Self {
        MigrationError::ConfigurationError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;

/// Failure reported by a job class for one batch.
///
/// This is data recorded on the batch job (`last_error`), not an engine error. A
/// non-retryable failure blocks the job immediately instead of spending its remaining
/// attempts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct JobFailure {
    pub reason: String,
    pub retryable: bool,
}

impl JobFailure {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }
}

impl From<MigrationError> for JobFailure {
    fn from(error: MigrationError) -> Self {
        Self::retryable(error.to_string())
    }
}
