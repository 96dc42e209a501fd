//! Pipeline behaviour of the backup controller against a scripted backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use hookbridge::core::process::{self, ExecutionContext, KILLED_EXIT_CODE};
use hookbridge::core::{
    Backend, BackupController, BackupRecord, BackupStatus, Deletion, HookConfig, JobOutcome,
    ProcessStatus, Stage,
};
use hookbridge::error::BridgeError;
use tempfile::tempdir;

enum Behavior {
    Succeed,
    Fail,
    /// Shell out through the shared execution context.
    Command(String),
    /// Shell out, but hide the runner error behind a plain message.
    WrappedCommand(String),
    /// In-process work that no process handle can interrupt.
    Sleep(Duration),
}

struct FakeBackend {
    behavior: Behavior,
    calls: AtomicUsize,
    records: Mutex<Vec<BackupRecord>>,
    last_process: Mutex<Option<ProcessStatus>>,
}

impl FakeBackend {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
            records: Mutex::new(Vec::new()),
            last_process: Mutex::new(None),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_process(&self) -> Option<ProcessStatus> {
        self.last_process.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn create_new_backup(
        &self,
        id: &str,
        timeout: Duration,
        ctx: &ExecutionContext,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Succeed => {}
            Behavior::Fail => anyhow::bail!("storage unavailable"),
            Behavior::Command(command) => {
                let result = process::run(command, timeout, ctx).await;
                *self.last_process.lock().unwrap() = ctx.process().map(|h| h.status());
                result?;
            }
            Behavior::WrappedCommand(command) => {
                if let Err(error) = process::run(command, timeout, ctx).await {
                    anyhow::bail!("snapshot tool failed: {error}");
                }
            }
            Behavior::Sleep(duration) => tokio::time::sleep(*duration).await,
        }

        let mut record = BackupRecord::new(id, BackupStatus::Completed, "done");
        record.size_mb = 42.0;
        self.records.lock().unwrap().push(record);
        Ok(())
    }

    async fn delete_backup(&self, id: &str) -> Result<()> {
        self.records.lock().unwrap().retain(|r| r.id != id);
        Ok(())
    }

    async fn get_all_backups(&self) -> Result<Vec<BackupRecord>> {
        Ok(self.records.lock().unwrap().clone())
    }

    async fn get_backup(&self, id: &str) -> Result<Option<BackupRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }
}

fn hooks(pre: Option<&str>, post: Option<&str>, timeout: Duration) -> HookConfig {
    HookConfig {
        pre_backup_command: pre.map(str::to_string),
        post_backup_command: post.map(str::to_string),
        timeout,
    }
}

fn controller(backend: Arc<FakeBackend>, hooks: HookConfig) -> BackupController {
    BackupController::new(backend, hooks)
}

async fn wait_idle(controller: &BackupController, limit: Duration) {
    let start = Instant::now();
    while controller.running_id().is_some() {
        assert!(start.elapsed() < limit, "job slot never returned to idle");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_live_process(controller: &BackupController) {
    let start = Instant::now();
    while controller.execution_context().live_process().is_none() {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "no live process appeared"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_backup_without_hooks_completes() {
    let backend = FakeBackend::new(Behavior::Succeed);
    let controller = controller(backend.clone(), HookConfig::default());

    let id = controller.trigger_backup().unwrap();
    wait_idle(&controller, Duration::from_secs(5)).await;

    assert_eq!(backend.calls(), 1);
    let record = controller.get_status(&id).await.unwrap();
    assert_eq!(record.status, BackupStatus::Completed);
    assert_eq!(record.size_mb, 42.0);

    let last = controller.last_run().unwrap();
    assert_eq!(last.id, id);
    assert_eq!(last.outcome, JobOutcome::Success);
}

#[tokio::test]
async fn test_failing_pre_hook_skips_backend() {
    let backend = FakeBackend::new(Behavior::Succeed);
    let controller = controller(
        backend.clone(),
        hooks(Some("exit 1"), None, Duration::from_secs(5)),
    );

    let id = controller.trigger_backup().unwrap();
    wait_idle(&controller, Duration::from_secs(5)).await;

    assert_eq!(backend.calls(), 0);
    assert!(matches!(
        controller.get_status(&id).await,
        Err(BridgeError::NotFound(_))
    ));
    assert!(matches!(
        controller.last_run().unwrap().outcome,
        JobOutcome::Failure {
            stage: Stage::PreHook,
            ..
        }
    ));
}

#[tokio::test]
async fn test_backend_command_killed_after_timeout() {
    let backend = FakeBackend::new(Behavior::Command("sleep 30".to_string()));
    let controller = controller(backend.clone(), hooks(None, None, Duration::from_secs(2)));

    let start = Instant::now();
    controller.trigger_backup().unwrap();
    wait_idle(&controller, Duration::from_secs(10)).await;
    let took = start.elapsed();

    assert!(took >= Duration::from_secs(2));
    assert!(took < Duration::from_secs(5), "kill took {took:?}");

    let status = backend.last_process().unwrap();
    assert_eq!(status.exit, Some(KILLED_EXIT_CODE));

    match controller.last_run().unwrap().outcome {
        JobOutcome::TimedOut { stage, elapsed } => {
            assert_eq!(stage, Stage::Backup);
            assert!(elapsed >= Duration::from_secs(2));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancel_mid_flight_backend_process() {
    let backend = FakeBackend::new(Behavior::Command("sleep 30".to_string()));
    let controller = controller(backend.clone(), hooks(None, None, Duration::from_secs(60)));

    let id = controller.trigger_backup().unwrap();
    wait_live_process(&controller).await;

    assert_eq!(
        controller.delete_backup(&id).await.unwrap(),
        Deletion::Cancelled
    );
    wait_idle(&controller, Duration::from_secs(5)).await;

    assert_eq!(
        controller.last_run().unwrap().outcome,
        JobOutcome::Cancelled {
            stage: Stage::Backup
        }
    );
    assert_eq!(backend.last_process().unwrap().exit, Some(KILLED_EXIT_CODE));

    // slot is free again
    let next = controller.trigger_backup().unwrap();
    wait_live_process(&controller).await;
    controller.cancel_backup(&next).unwrap();
    wait_idle(&controller, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_wrapped_backend_error_classified_as_timeout() {
    let backend = FakeBackend::new(Behavior::WrappedCommand("sleep 30".to_string()));
    let controller = controller(backend, hooks(None, None, Duration::from_secs(1)));

    controller.trigger_backup().unwrap();
    wait_idle(&controller, Duration::from_secs(10)).await;

    match controller.last_run().unwrap().outcome {
        JobOutcome::TimedOut { stage, elapsed } => {
            assert_eq!(stage, Stage::Backup);
            assert!(elapsed >= Duration::from_secs(1));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_wrapped_backend_error_classified_as_cancelled() {
    let backend = FakeBackend::new(Behavior::WrappedCommand("sleep 30".to_string()));
    let controller = controller(backend, hooks(None, None, Duration::from_secs(60)));

    let id = controller.trigger_backup().unwrap();
    wait_live_process(&controller).await;
    controller.cancel_backup(&id).unwrap();
    wait_idle(&controller, Duration::from_secs(5)).await;

    assert_eq!(
        controller.last_run().unwrap().outcome,
        JobOutcome::Cancelled {
            stage: Stage::Backup
        }
    );
}

#[tokio::test]
async fn test_wrapped_backend_error_keeps_failure_reason() {
    let backend = FakeBackend::new(Behavior::WrappedCommand("exit 9".to_string()));
    let controller = controller(backend, HookConfig::default());

    controller.trigger_backup().unwrap();
    wait_idle(&controller, Duration::from_secs(5)).await;

    match controller.last_run().unwrap().outcome {
        JobOutcome::Failure { stage, reason } => {
            assert_eq!(stage, Stage::Backup);
            assert!(reason.contains("snapshot tool failed"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancel_pre_hook() {
    let backend = FakeBackend::new(Behavior::Succeed);
    let controller = controller(
        backend.clone(),
        hooks(Some("sleep 30"), None, Duration::from_secs(60)),
    );

    let id = controller.trigger_backup().unwrap();
    wait_live_process(&controller).await;
    controller.cancel_backup(&id).unwrap();
    wait_idle(&controller, Duration::from_secs(5)).await;

    assert_eq!(backend.calls(), 0);
    assert_eq!(
        controller.last_run().unwrap().outcome,
        JobOutcome::Cancelled {
            stage: Stage::PreHook
        }
    );
}

#[tokio::test]
async fn test_cancel_targets_only_running_id() {
    let backend = FakeBackend::new(Behavior::Command("sleep 30".to_string()));
    let controller = controller(backend, hooks(None, None, Duration::from_secs(60)));

    let id = controller.trigger_backup().unwrap();
    wait_live_process(&controller).await;

    assert!(matches!(
        controller.cancel_backup("some-other-id"),
        Err(BridgeError::NotRunning(_))
    ));
    assert!(controller.execution_context().live_process().is_some());
    assert_eq!(controller.running_id(), Some(id.clone()));

    controller.cancel_backup(&id).unwrap();
    wait_idle(&controller, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_cancel_without_live_process() {
    let backend = FakeBackend::new(Behavior::Sleep(Duration::from_millis(500)));
    let controller = controller(backend, HookConfig::default());

    let id = controller.trigger_backup().unwrap();

    assert!(matches!(
        controller.cancel_backup(&id),
        Err(BridgeError::NoLiveProcess(_))
    ));
    assert_eq!(controller.running_id(), Some(id));

    wait_idle(&controller, Duration::from_secs(5)).await;
    assert!(controller.last_run().unwrap().outcome.is_success());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_only_one_wins() {
    let backend = FakeBackend::new(Behavior::Sleep(Duration::from_millis(500)));
    let controller = controller(backend.clone(), HookConfig::default());

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let controller = controller.clone();
            tokio::spawn(async move { controller.trigger_backup() })
        })
        .collect();

    let mut accepted = Vec::new();
    let mut conflicts = Vec::new();
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(id) => accepted.push(id),
            Err(BridgeError::Conflict { running_id }) => conflicts.push(running_id),
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }

    assert_eq!(accepted.len(), 1);
    assert_eq!(conflicts.len(), 7);
    assert!(conflicts.iter().all(|running| running == &accepted[0]));

    wait_idle(&controller, Duration::from_secs(5)).await;
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_status_is_running_during_pre_hook() {
    let backend = FakeBackend::new(Behavior::Succeed);
    let controller = controller(
        backend.clone(),
        hooks(Some("sleep 1"), None, Duration::from_secs(10)),
    );

    let id = controller.trigger_backup().unwrap();

    let record = controller.get_status(&id).await.unwrap();
    assert_eq!(record.status, BackupStatus::Running);
    assert_eq!(record.size_mb, -1.0);
    assert!(backend.get_backup(&id).await.unwrap().is_none());

    wait_idle(&controller, Duration::from_secs(5)).await;
    assert_eq!(
        controller.get_status(&id).await.unwrap().status,
        BackupStatus::Completed
    );
}

#[tokio::test]
async fn test_post_hook_failure_frees_slot() {
    let backend = FakeBackend::new(Behavior::Succeed);
    let controller = controller(
        backend.clone(),
        hooks(None, Some("exit 4"), Duration::from_secs(5)),
    );

    let id = controller.trigger_backup().unwrap();
    wait_idle(&controller, Duration::from_secs(5)).await;

    // backend kept the backup even though the pipeline did not finish cleanly
    assert_eq!(
        controller.get_status(&id).await.unwrap().status,
        BackupStatus::Completed
    );
    assert!(matches!(
        controller.last_run().unwrap().outcome,
        JobOutcome::Failure {
            stage: Stage::PostHook,
            ..
        }
    ));
    controller.trigger_backup().unwrap();
}

#[tokio::test]
async fn test_backend_failure_frees_slot() {
    let backend = FakeBackend::new(Behavior::Fail);
    let controller = controller(backend.clone(), HookConfig::default());

    controller.trigger_backup().unwrap();
    wait_idle(&controller, Duration::from_secs(5)).await;

    match controller.last_run().unwrap().outcome {
        JobOutcome::Failure { stage, reason } => {
            assert_eq!(stage, Stage::Backup);
            assert!(reason.contains("storage unavailable"));
        }
        other => panic!("expected failure, got {other:?}"),
    }

    controller.trigger_backup().unwrap();
    wait_idle(&controller, Duration::from_secs(5)).await;
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn test_hooks_wrap_backend_in_order() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("order.log");
    let backend = FakeBackend::new(Behavior::Command(format!(
        "echo backup >> {}",
        log.display()
    )));
    let controller = controller(
        backend,
        hooks(
            Some(&format!("echo pre >> {}", log.display())),
            Some(&format!("echo post >> {}", log.display())),
            Duration::from_secs(5),
        ),
    );

    controller.trigger_backup().unwrap();
    wait_idle(&controller, Duration::from_secs(5)).await;

    let lines: Vec<String> = std::fs::read_to_string(&log)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(lines, vec!["pre", "backup", "post"]);
    assert!(controller.last_run().unwrap().outcome.is_success());
}

#[tokio::test]
async fn test_delete_stored_and_unknown_backups() {
    let backend = FakeBackend::new(Behavior::Succeed);
    let controller = controller(backend.clone(), HookConfig::default());

    let id = controller.trigger_backup().unwrap();
    wait_idle(&controller, Duration::from_secs(5)).await;

    assert_eq!(
        controller.delete_backup(&id).await.unwrap(),
        Deletion::Deleted
    );
    assert!(backend.get_backup(&id).await.unwrap().is_none());
    assert!(matches!(
        controller.delete_backup("missing").await,
        Err(BridgeError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_shutdown_cancels_running_backup() {
    let backend = FakeBackend::new(Behavior::Command("sleep 30".to_string()));
    let controller = controller(backend.clone(), hooks(None, None, Duration::from_secs(60)));

    let id = controller.trigger_backup().unwrap();
    wait_live_process(&controller).await;

    let start = Instant::now();
    controller.shutdown(Duration::from_secs(5)).await;

    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(controller.running_id(), None);
    let last = controller.last_run().unwrap();
    assert_eq!(last.id, id);
    assert_eq!(
        last.outcome,
        JobOutcome::Cancelled {
            stage: Stage::Backup
        }
    );
    assert_eq!(backend.last_process().unwrap().exit, Some(KILLED_EXIT_CODE));
}

#[tokio::test]
async fn test_shutdown_when_idle_returns_immediately() {
    let backend = FakeBackend::new(Behavior::Succeed);
    let controller = controller(backend, HookConfig::default());

    let start = Instant::now();
    controller.shutdown(Duration::from_secs(5)).await;
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(controller.last_run().is_none());
}
