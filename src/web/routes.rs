use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;

use crate::backends::BackendType;
use crate::context::AppContext;
use crate::core::{BackupRecord, Deletion, LastRun};
use crate::error::BridgeError;

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Conflict { .. } | Self::NoLiveProcess(_) => StatusCode::CONFLICT,
            Self::NotFound(_) | Self::NotRunning(_) => StatusCode::NOT_FOUND,
            Self::CancelFailed { .. }
            | Self::StageFailure { .. }
            | Self::Timeout { .. }
            | Self::Cancelled { .. }
            | Self::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::warn!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        let body = json!({ "error": self.kind(), "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

pub async fn list_backups(
    State(ctx): State<AppContext>,
) -> Result<Json<Vec<BackupRecord>>, BridgeError> {
    Ok(Json(ctx.controller.list_backups().await?))
}

pub async fn create_backup(
    State(ctx): State<AppContext>,
) -> Result<(StatusCode, Json<BackupRecord>), BridgeError> {
    let id = ctx.controller.trigger_backup()?;
    Ok((
        StatusCode::ACCEPTED,
        Json(BackupRecord::running(id, "backup triggered")),
    ))
}

pub async fn get_backup(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<BackupRecord>, BridgeError> {
    Ok(Json(ctx.controller.get_status(&id).await?))
}

pub async fn delete_backup(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<BackupRecord>, BridgeError> {
    let record = match ctx.controller.delete_backup(&id).await? {
        Deletion::Cancelled => {
            BackupRecord::deleted(id, "Running backup task was cancelled successfully")
        }
        Deletion::Deleted => BackupRecord::deleted(id, "backup deleted successfully"),
    };
    Ok(Json(record))
}

#[derive(Debug, Serialize)]
pub struct DaemonStatus {
    pub version: &'static str,
    pub uptime_secs: u64,
    pub listen_addr: String,
    pub backend: BackendType,
    pub running_id: Option<String>,
    pub pre_backup_command: Option<String>,
    pub post_backup_command: Option<String>,
    pub pre_post_timeout_secs: u64,
    pub last_run: Option<LastRun>,
}

pub async fn daemon_status(State(ctx): State<AppContext>) -> Json<DaemonStatus> {
    let hooks = ctx.controller.hooks();
    Json(DaemonStatus {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: ctx.started_at.elapsed().as_secs(),
        listen_addr: ctx.config.bind_addr().to_string(),
        backend: ctx.config.backend,
        running_id: ctx.controller.running_id(),
        pre_backup_command: hooks.pre_backup_command.clone(),
        post_backup_command: hooks.post_backup_command.clone(),
        pre_post_timeout_secs: hooks.timeout.as_secs(),
        last_run: ctx.controller.last_run(),
    })
}
