//! Single-slot backup job controller.
//!
//! At most one backup runs at a time. An accepted trigger claims the
//! [`JobSlot`] and spawns a detached pipeline task that runs the pre-backup
//! command, the backend backup and the post-backup command in order. Any
//! stage failure ends the job; the slot is freed on every exit path.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::BridgeError;

use super::backend::Backend;
use super::models::{BackupRecord, JobOutcome, LastRun, Stage};
use super::process::{self, ExecutionContext, ProcessError};

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Commands wrapped around every backup.
#[derive(Debug, Clone)]
pub struct HookConfig {
    pub pre_backup_command: Option<String>,
    pub post_backup_command: Option<String>,
    /// Deadline for each hook and for the backend backup.
    pub timeout: Duration,
}

impl HookConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            pre_backup_command: non_empty(config.pre_backup_command.as_deref()),
            post_backup_command: non_empty(config.post_backup_command.as_deref()),
            timeout: config.pre_post_timeout(),
        }
    }
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            pre_backup_command: None,
            post_backup_command: None,
            timeout: Duration::from_secs(crate::config::DEFAULT_PRE_POST_TIMEOUT_SECS),
        }
    }
}

fn non_empty(command: Option<&str>) -> Option<String> {
    command
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

/// Id of the backup currently in flight, if any.
#[derive(Debug, Default)]
pub struct JobSlot {
    running_id: Mutex<Option<String>>,
}

impl JobSlot {
    pub fn current(&self) -> Option<String> {
        self.lock().clone()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.lock().as_deref() == Some(id)
    }

    /// Claim the slot for `id`, or return the id already holding it.
    fn try_acquire(&self, id: &str) -> Result<(), String> {
        let mut running = self.lock();
        match running.as_ref() {
            Some(current) => Err(current.clone()),
            None => {
                *running = Some(id.to_string());
                Ok(())
            }
        }
    }

    fn release(&self, id: &str) {
        let mut running = self.lock();
        if running.as_deref() == Some(id) {
            *running = None;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<String>> {
        self.running_id.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Result of a DELETE on a backup id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    /// The id was the running job and its process was told to stop.
    Cancelled,
    /// The backend removed the stored backup.
    Deleted,
}

struct Inner {
    backend: Arc<dyn Backend>,
    hooks: HookConfig,
    slot: JobSlot,
    context: ExecutionContext,
    last_run: Mutex<Option<LastRun>>,
}

#[derive(Clone)]
pub struct BackupController {
    inner: Arc<Inner>,
}

impl BackupController {
    pub fn new(backend: Arc<dyn Backend>, hooks: HookConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                hooks,
                slot: JobSlot::default(),
                context: ExecutionContext::new(),
                last_run: Mutex::new(None),
            }),
        }
    }

    pub async fn init(&self) -> Result<(), BridgeError> {
        self.inner.backend.init().await?;
        Ok(())
    }

    pub fn hooks(&self) -> &HookConfig {
        &self.inner.hooks
    }

    /// Id of the running backup, if any.
    pub fn running_id(&self) -> Option<String> {
        self.inner.slot.current()
    }

    /// Context the running job publishes its current process into.
    pub fn execution_context(&self) -> &ExecutionContext {
        &self.inner.context
    }

    pub fn last_run(&self) -> Option<LastRun> {
        self.inner
            .last_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start a backup in the background and return its id right away.
    ///
    /// Fails with [`BridgeError::Conflict`] while another backup is running.
    pub fn trigger_backup(&self) -> Result<String, BridgeError> {
        let id = Uuid::now_v7().to_string();

        if let Err(running_id) = self.inner.slot.try_acquire(&id) {
            tracing::info!(%running_id, "Another backup is already running, rejecting trigger");
            return Err(BridgeError::Conflict { running_id });
        }

        tracing::info!(%id, "Backup triggered");
        let span = tracing::info_span!("backup", %id);
        tokio::spawn(run_pipeline(self.inner.clone(), id.clone()).instrument(span));

        Ok(id)
    }

    /// Stop the process the running backup `id` is currently executing.
    ///
    /// Only signals the process; the pipeline frees the slot once the
    /// stopped stage unwinds.
    pub fn cancel_backup(&self, id: &str) -> Result<(), BridgeError> {
        // holding the slot lock keeps the job from being replaced underneath us
        let running = self.inner.slot.lock();
        if running.as_deref() != Some(id) {
            return Err(BridgeError::NotRunning(id.to_string()));
        }

        let handle = self
            .inner
            .context
            .live_process()
            .ok_or_else(|| BridgeError::NoLiveProcess(id.to_string()))?;

        tracing::debug!(%id, command = handle.command(), "Cancelling running backup");
        match handle.stop() {
            Ok(()) => Ok(()),
            // exited between the lookup and the stop
            Err(ProcessError::NotRunning { .. }) => {
                Err(BridgeError::NoLiveProcess(id.to_string()))
            }
            Err(source) => Err(BridgeError::CancelFailed {
                id: id.to_string(),
                source,
            }),
        }
    }

    /// Cancel whatever backup is running and wait up to `grace` for its
    /// pipeline to unwind, so no process group outlives the daemon.
    ///
    /// Keeps retrying while the job has no live process, since the pipeline
    /// may still be about to start its next stage.
    pub async fn shutdown(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        while let Some(id) = self.running_id() {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(%id, "Backup still running at shutdown");
                return;
            }
            match self.cancel_backup(&id) {
                Ok(()) => tracing::info!(%id, "Cancelling running backup for shutdown"),
                Err(BridgeError::NoLiveProcess(_) | BridgeError::NotRunning(_)) => {}
                Err(error) => tracing::warn!(%id, %error, "Couldn't cancel backup for shutdown"),
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
    }

    pub async fn get_status(&self, id: &str) -> Result<BackupRecord, BridgeError> {
        if self.inner.slot.is_running(id) {
            return Ok(BackupRecord::running(id, "backup is still running"));
        }

        self.inner
            .backend
            .get_backup(id)
            .await?
            .ok_or_else(|| BridgeError::NotFound(id.to_string()))
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupRecord>, BridgeError> {
        Ok(self.inner.backend.get_all_backups().await?)
    }

    /// Cancel `id` if it is the running backup, otherwise delete it from the
    /// backend.
    pub async fn delete_backup(&self, id: &str) -> Result<Deletion, BridgeError> {
        match self.cancel_backup(id) {
            Ok(()) => return Ok(Deletion::Cancelled),
            Err(BridgeError::NotRunning(_)) => {}
            Err(other) => return Err(other),
        }

        if self.inner.backend.get_backup(id).await?.is_none() {
            return Err(BridgeError::NotFound(id.to_string()));
        }
        self.inner.backend.delete_backup(id).await?;
        tracing::debug!(%id, "Backup deleted");
        Ok(Deletion::Deleted)
    }
}

/// Frees the job slot when the pipeline ends, including by panic.
struct SlotRelease {
    inner: Arc<Inner>,
    id: String,
}

impl Drop for SlotRelease {
    fn drop(&mut self) {
        self.inner.context.clear();
        self.inner.slot.release(&self.id);
    }
}

async fn run_pipeline(inner: Arc<Inner>, id: String) {
    let _release = SlotRelease {
        inner: inner.clone(),
        id: id.clone(),
    };
    let started_at = Utc::now();

    let outcome = match inner.run_stages(&id).await {
        Ok(()) => JobOutcome::Success,
        Err(error) => outcome_of(error),
    };

    match &outcome {
        JobOutcome::Success => tracing::info!("Backup finished"),
        JobOutcome::Failure {
            stage: Stage::PostHook,
            reason,
        } => tracing::warn!(%reason, "Backup stored but post-backup command failed"),
        JobOutcome::Failure { stage, reason } => tracing::error!(%stage, %reason, "Backup failed"),
        JobOutcome::TimedOut { stage, elapsed } => tracing::warn!(
            %stage,
            elapsed_secs = elapsed.as_secs(),
            "Backup timeout enforced"
        ),
        JobOutcome::Cancelled { stage } => tracing::info!(%stage, "Backup cancelled"),
    }

    *inner.last_run.lock().unwrap_or_else(PoisonError::into_inner) = Some(LastRun {
        id,
        outcome,
        started_at,
        finished_at: Utc::now(),
    });
}

fn outcome_of(error: BridgeError) -> JobOutcome {
    match error {
        BridgeError::Timeout { stage, elapsed } => JobOutcome::TimedOut { stage, elapsed },
        BridgeError::Cancelled { stage } => JobOutcome::Cancelled { stage },
        BridgeError::StageFailure { stage, reason } => JobOutcome::Failure { stage, reason },
        other => JobOutcome::Failure {
            stage: Stage::Backup,
            reason: other.to_string(),
        },
    }
}

impl Inner {
    async fn run_stages(&self, id: &str) -> Result<(), BridgeError> {
        if let Some(command) = &self.hooks.pre_backup_command {
            self.run_hook(Stage::PreHook, command).await?;
        }

        tracing::info!("Running backup");
        let backup_started = Utc::now();
        if let Err(error) = self
            .backend
            .create_new_backup(id, self.hooks.timeout, &self.context)
            .await
        {
            return Err(self.backend_failure(error, backup_started));
        }
        tracing::debug!("Backup creation success on backend");

        if let Some(command) = &self.hooks.post_backup_command {
            self.run_hook(Stage::PostHook, command).await?;
        }

        Ok(())
    }

    async fn run_hook(&self, stage: Stage, command: &str) -> Result<(), BridgeError> {
        tracing::info!(%stage, command, "Running hook");
        match process::run(command, self.hooks.timeout, &self.context).await {
            Ok(output) => {
                tracing::debug!(%stage, %output, "Hook succeeded");
                Ok(())
            }
            Err(error) => {
                tracing::debug!(%stage, output = error.output().unwrap_or_default(), %error, "Hook failed");
                Err(BridgeError::from_process(stage, &error))
            }
        }
    }

    /// Work out whether a backend error came from a killed process.
    fn backend_failure(
        &self,
        error: anyhow::Error,
        backup_started: chrono::DateTime<Utc>,
    ) -> BridgeError {
        if let Some(process_error) = error.downcast_ref::<ProcessError>() {
            return BridgeError::from_process(Stage::Backup, process_error);
        }

        // the backend shelled out but wrapped the runner error in its own
        if let Some(status) = self
            .context
            .process()
            .map(|handle| handle.status())
            .filter(|status| status.started_at >= backup_started)
        {
            match status.termination {
                Some(process::Termination::Deadline) => {
                    return BridgeError::Timeout {
                        stage: Stage::Backup,
                        elapsed: status.elapsed(),
                    };
                }
                Some(process::Termination::Stopped) => {
                    return BridgeError::Cancelled {
                        stage: Stage::Backup,
                    };
                }
                _ => {}
            }
        }

        BridgeError::StageFailure {
            stage: Stage::Backup,
            reason: format!("{error:#}"),
        }
    }
}
