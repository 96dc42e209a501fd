use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::core::Backend;
use crate::core::models::{BackupRecord, BackupStatus};
use crate::core::process::ExecutionContext;

/// In-process backend for local runs. Backups take `duration` and are
/// always 500 MB.
pub struct SimulatedBackend {
    duration: Duration,
    records: RwLock<BTreeMap<String, BackupRecord>>,
}

impl SimulatedBackend {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            records: RwLock::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl Backend for SimulatedBackend {
    async fn init(&self) -> Result<()> {
        tracing::info!(duration_secs = self.duration.as_secs(), "Simulated backend ready");
        Ok(())
    }

    async fn create_new_backup(
        &self,
        id: &str,
        timeout: Duration,
        _ctx: &ExecutionContext,
    ) -> Result<()> {
        if !timeout.is_zero() && self.duration > timeout {
            sleep(timeout).await;
            let record = BackupRecord::new(id, BackupStatus::Error, "simulated backup timed out");
            self.records.write().await.insert(id.to_string(), record);
            bail!("simulated backup exceeded {}s timeout", timeout.as_secs());
        }

        sleep(self.duration).await;

        let mut record = BackupRecord::new(id, BackupStatus::Completed, "simulated backup");
        record.data_id = format!("sim-{id}");
        record.size_mb = 500.0;
        self.records.write().await.insert(id.to_string(), record);
        Ok(())
    }

    async fn delete_backup(&self, id: &str) -> Result<()> {
        match self.records.write().await.get_mut(id) {
            Some(record) => {
                record.status = BackupStatus::Deleted;
                record.message = "backup deleted".to_string();
                Ok(())
            }
            None => bail!("backup {id} not found"),
        }
    }

    async fn get_all_backups(&self) -> Result<Vec<BackupRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn get_backup(&self, id: &str) -> Result<Option<BackupRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }
}
