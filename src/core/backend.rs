use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use super::models::BackupRecord;
use super::process::ExecutionContext;

/// Storage side of the bridge: whatever actually creates and tracks backups.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Called once before the HTTP surface starts.
    async fn init(&self) -> Result<()>;

    /// Create a backup and return only once it is complete.
    ///
    /// Backends that shell out should do so through
    /// [`process::run`](super::process::run) with `ctx`, so a DELETE for the
    /// running backup can stop the command.
    async fn create_new_backup(
        &self,
        id: &str,
        timeout: Duration,
        ctx: &ExecutionContext,
    ) -> Result<()>;

    /// Remove backup data from storage.
    async fn delete_backup(&self, id: &str) -> Result<()>;

    async fn get_all_backups(&self) -> Result<Vec<BackupRecord>>;

    /// `Ok(None)` when the backend has no record of `id`.
    async fn get_backup(&self, id: &str) -> Result<Option<BackupRecord>>;
}
