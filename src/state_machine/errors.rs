use crate::error::MigrationError;
use thiserror::Error;

/// Error types for state machine operations
#[derive(Error, Debug)]
pub enum StateMachineError {
    #[error("Guard condition failed: {reason}")]
    GuardFailed { reason: String },

    #[error("Invalid state transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Migration {migration_id} moved from {expected} to {actual} before the transition was written")]
    StatusChanged {
        migration_id: i64,
        expected: String,
        actual: String,
    },

    #[error("Persistence operation failed: {0}")]
    Persistence(#[from] MigrationError),
}

/// Guard condition failures
#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Business rule violation: {rule}")]
    BusinessRuleViolation { rule: String },

    #[error("Guard lookup failed: {0}")]
    Lookup(#[from] MigrationError),
}

impl From<GuardError> for StateMachineError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Lookup(inner) => Self::Persistence(inner),
            other => Self::GuardFailed {
                reason: other.to_string(),
            },
        }
    }
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
pub type GuardResult<T> = Result<T, GuardError>;

pub fn business_rule_violation(rule: impl Into<String>) -> GuardError {
    GuardError::BusinessRuleViolation { rule: rule.into() }
}

impl From<StateMachineError> for MigrationError {
    fn from(err: StateMachineError) -> Self {
        match err {
            StateMachineError::GuardFailed { reason } => MigrationError::GuardFailed(reason),
            StateMachineError::InvalidTransition { from, event } => {
                MigrationError::InvalidTransition(format!("from {from} on {event}"))
            }
            StateMachineError::StatusChanged {
                migration_id,
                expected,
                actual,
            } => MigrationError::StatusConflict {
                migration_id,
                expected,
                actual,
            },
            StateMachineError::Persistence(inner) => inner,
        }
    }
}
