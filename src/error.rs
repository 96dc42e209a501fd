use std::time::Duration;

use thiserror::Error;

use crate::core::models::Stage;
use crate::core::process::{ProcessError, Termination};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Another backup id {running_id} is already running")]
    Conflict { running_id: String },

    #[error("Backup {0} not found")]
    NotFound(String),

    #[error("Backup {0} is not the running backup")]
    NotRunning(String),

    #[error("Backup {0} has no running process that can be cancelled")]
    NoLiveProcess(String),

    #[error("Couldn't cancel running backup {id}: {source}")]
    CancelFailed {
        id: String,
        #[source]
        source: ProcessError,
    },

    #[error("{stage} failed: {reason}")]
    StageFailure { stage: Stage, reason: String },

    #[error("{stage} timeout enforced after {} seconds", .elapsed.as_secs())]
    Timeout { stage: Stage, elapsed: Duration },

    #[error("{stage} was cancelled")]
    Cancelled { stage: Stage },

    #[error("backend error: {0:#}")]
    Backend(#[from] anyhow::Error),
}

impl BridgeError {
    /// Short machine-readable name used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "conflict",
            Self::NotFound(_) => "not_found",
            Self::NotRunning(_) => "not_running",
            Self::NoLiveProcess(_) => "no_live_process",
            Self::CancelFailed { .. } => "cancel_failed",
            Self::StageFailure { .. } => "stage_failure",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Backend(_) => "backend",
        }
    }

    /// Classify a runner error raised while executing `stage`.
    pub fn from_process(stage: Stage, error: &ProcessError) -> Self {
        match error {
            ProcessError::Killed {
                termination: Termination::Deadline,
                elapsed,
                ..
            } => Self::Timeout {
                stage,
                elapsed: *elapsed,
            },
            ProcessError::Killed {
                termination: Termination::Stopped,
                ..
            } => Self::Cancelled { stage },
            other => Self::StageFailure {
                stage,
                reason: other.to_string(),
            },
        }
    }
}
