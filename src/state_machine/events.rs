use serde::{Deserialize, Serialize};

/// Events that drive migration status transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationEvent {
    Pause,
    Execute,
    Finish,
    Failure,
    Finalize,
}

impl MigrationEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Execute => "execute",
            Self::Finish => "finish",
            Self::Failure => "failure",
            Self::Finalize => "finalize",
        }
    }

    pub fn all() -> [MigrationEvent; 5] {
        [
            Self::Pause,
            Self::Execute,
            Self::Finish,
            Self::Failure,
            Self::Finalize,
        ]
    }
}

/// Events that drive batch job transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum JobEvent {
    /// Hand the job to its job class
    Start,
    Succeed,
    /// Record a failed attempt with the reported reason
    Fail(String),
    /// Clear the attempt counter so the job can run again
    ResetAttempts,
}

impl JobEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Succeed => "succeed",
            Self::Fail(_) => "fail",
            Self::ResetAttempts => "reset_attempts",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }
}
