use serde::{Deserialize, Serialize};
use std::fmt;

/// Migration status. Discriminants are the persisted SMALLINT values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum MigrationStatus {
    /// Initial state; not dispatched
    #[default]
    Paused = 0,
    /// Eligible for dispatch by an executor
    Active = 1,
    /// Every batch job succeeded
    Finished = 3,
    /// Stopped by the failure monitor or a structural error
    Failed = 4,
    /// Remaining batches are being run inline
    Finalizing = 5,
}

impl MigrationStatus {
    /// All statuses in declaration order
    pub fn valid_statuses() -> [MigrationStatus; 5] {
        [
            Self::Paused,
            Self::Active,
            Self::Finished,
            Self::Failed,
            Self::Finalizing,
        ]
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// Active or paused, i.e. still waiting for work to be done
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paused => write!(f, "paused"),
            Self::Active => write!(f, "active"),
            Self::Finished => write!(f, "finished"),
            Self::Failed => write!(f, "failed"),
            Self::Finalizing => write!(f, "finalizing"),
        }
    }
}

impl std::str::FromStr for MigrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "paused" => Ok(Self::Paused),
            "active" => Ok(Self::Active),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            "finalizing" => Ok(Self::Finalizing),
            _ => Err(format!("Invalid migration status: {s}")),
        }
    }
}

/// Batch job status. Discriminants are the persisted SMALLINT values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum JobStatus {
    /// Created, not yet started
    #[default]
    Pending = 0,
    /// Handed to the job class
    Running = 1,
    /// Last attempt failed; retriable while attempts remain
    Failed = 2,
    Succeeded = 3,
    /// Failed on its final attempt; excluded from automatic retry
    BlockedByMaxAttempts = 4,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Failed outright or blocked after exhausting its attempts
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::BlockedByMaxAttempts)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Failed => write!(f, "failed"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::BlockedByMaxAttempts => write!(f, "blocked_by_max_attempts"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            "succeeded" => Ok(Self::Succeeded),
            "blocked_by_max_attempts" => Ok(Self::BlockedByMaxAttempts),
            _ => Err(format!("Invalid batched job status: {s}")),
        }
    }
}
