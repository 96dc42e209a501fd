use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::models::{BackupRecord, BackupStatus};
use crate::core::process::{self, ExecutionContext};
use crate::core::Backend;

const ID_PLACEHOLDER: &str = "{id}";

/// Backend that runs a shell command per backup.
///
/// The backup command's last non-empty output line is reported as the
/// backup's `data_id`. Records live in memory only.
pub struct ShellBackend {
    backup_command: String,
    delete_command: Option<String>,
    delete_timeout: Duration,
    records: RwLock<BTreeMap<String, BackupRecord>>,
}

impl ShellBackend {
    pub fn new(
        backup_command: impl Into<String>,
        delete_command: Option<String>,
        delete_timeout: Duration,
    ) -> Self {
        Self {
            backup_command: backup_command.into(),
            delete_command: delete_command.filter(|c| !c.trim().is_empty()),
            delete_timeout,
            records: RwLock::new(BTreeMap::new()),
        }
    }

    async fn store(&self, record: BackupRecord) {
        self.records.write().await.insert(record.id.clone(), record);
    }
}

fn render(template: &str, id: &str) -> String {
    template.replace(ID_PLACEHOLDER, id)
}

fn last_line(output: &str) -> Option<&str> {
    output.lines().map(str::trim).filter(|l| !l.is_empty()).last()
}

#[async_trait]
impl Backend for ShellBackend {
    async fn init(&self) -> Result<()> {
        if self.backup_command.trim().is_empty() {
            bail!("shell backend requires a backup command (--backup-command)");
        }
        tracing::info!(command = %self.backup_command, "Shell backend ready");
        Ok(())
    }

    async fn create_new_backup(
        &self,
        id: &str,
        timeout: Duration,
        ctx: &ExecutionContext,
    ) -> Result<()> {
        let command = render(&self.backup_command, id);
        self.store(BackupRecord::running(id, "backup in progress")).await;

        match process::run(&command, timeout, ctx).await {
            Ok(output) => {
                let mut record = BackupRecord::new(id, BackupStatus::Completed, "backup completed");
                record.data_id = last_line(&output).unwrap_or(id).to_string();
                self.store(record).await;
                Ok(())
            }
            Err(error) => {
                self.store(BackupRecord::new(id, BackupStatus::Error, error.to_string()))
                    .await;
                Err(error.into())
            }
        }
    }

    async fn delete_backup(&self, id: &str) -> Result<()> {
        if !self.records.read().await.contains_key(id) {
            bail!("backup {id} not found");
        }

        if let Some(template) = &self.delete_command {
            process::run(&render(template, id), self.delete_timeout, &ExecutionContext::new())
                .await
                .with_context(|| format!("delete command failed for backup {id}"))?;
        }

        if let Some(record) = self.records.write().await.get_mut(id) {
            record.status = BackupStatus::Deleted;
            record.message = "backup deleted".to_string();
        }
        Ok(())
    }

    async fn get_all_backups(&self) -> Result<Vec<BackupRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn get_backup(&self, id: &str) -> Result<Option<BackupRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }
}
