use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// Size reported while a backup's size is not known yet.
pub const UNKNOWN_SIZE_MB: f64 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Running,
    Completed,
    Deleted,
    Error,
}

/// A backup as reported over the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    #[serde(default)]
    pub data_id: String,
    pub status: BackupStatus,
    #[serde(default)]
    pub message: String,
    pub size_mb: f64,
}

impl BackupRecord {
    pub fn new(id: impl Into<String>, status: BackupStatus, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data_id: String::new(),
            status,
            message: message.into(),
            size_mb: UNKNOWN_SIZE_MB,
        }
    }

    pub fn running(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(id, BackupStatus::Running, message)
    }

    pub fn deleted(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(id, BackupStatus::Deleted, message)
    }
}

/// Pipeline stage of a backup job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PreHook,
    Backup,
    PostHook,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreHook => f.write_str("pre-backup command"),
            Self::Backup => f.write_str("backup"),
            Self::PostHook => f.write_str("post-backup command"),
        }
    }
}

/// How a backup job ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Failure {
        stage: Stage,
        reason: String,
    },
    TimedOut {
        stage: Stage,
        #[serde(rename = "elapsed_secs", serialize_with = "as_secs")]
        elapsed: Duration,
    },
    Cancelled {
        stage: Stage,
    },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// The stage the job ended in, `None` for a successful job.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Success => None,
            Self::Failure { stage, .. } | Self::TimedOut { stage, .. } | Self::Cancelled { stage } => {
                Some(*stage)
            }
        }
    }
}

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// The most recently finished job. Kept in memory only.
#[derive(Debug, Clone, Serialize)]
pub struct LastRun {
    pub id: String,
    #[serde(flatten)]
    pub outcome: JobOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
