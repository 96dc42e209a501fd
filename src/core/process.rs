//! Shell command execution with a deadline and an externally stoppable handle.
//!
//! Every command runs through `sh -c` in its own process group, so a deadline
//! or a stop request takes down everything the command spawned and not only
//! the shell. The live handle is published into an [`ExecutionContext`] that
//! other tasks can read to inspect or stop the process.

use std::fmt;
use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Exit code recorded for a process that did not finish on its own.
pub const KILLED_EXIT_CODE: i32 = -1;

/// How long to keep reading output after the process is gone.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Why a process stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The process exited by itself (successfully or not).
    Exited,
    /// The deadline fired and the process was killed.
    Deadline,
    /// Someone called [`ProcessHandle::stop`].
    Stopped,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited => f.write_str("exited"),
            Self::Deadline => f.write_str("deadline exceeded"),
            Self::Stopped => f.write_str("stop requested"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for `{command}`: {source}")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with status {}", .code.map_or_else(|| "unknown".to_string(), |c| c.to_string()))]
    Exited {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("`{command}` was killed after {}s ({termination})", .elapsed.as_secs())]
    Killed {
        command: String,
        termination: Termination,
        elapsed: Duration,
        output: String,
    },

    #[error("`{command}` is not running")]
    NotRunning { command: String },
}

impl ProcessError {
    /// Output captured before the failure, if the process got that far.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Exited { output, .. } | Self::Killed { output, .. } => Some(output),
            _ => None,
        }
    }

    /// The termination cause when the process was killed.
    pub fn termination(&self) -> Option<Termination> {
        match self {
            Self::Killed { termination, .. } => Some(*termination),
            _ => None,
        }
    }
}

/// Snapshot of a process' lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub pid: Option<u32>,
    /// `None` while running, [`KILLED_EXIT_CODE`] when killed.
    pub exit: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub termination: Option<Termination>,
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        self.exit.is_none()
    }

    /// Time between spawn and exit, or until now if still running.
    pub fn elapsed(&self) -> Duration {
        let end = self.stopped_at.unwrap_or_else(Utc::now);
        (end - self.started_at).to_std().unwrap_or_default()
    }
}

/// A spawned command, shared between the runner and anyone holding the
/// [`ExecutionContext`] it was published into.
#[derive(Debug)]
pub struct ProcessHandle {
    command: String,
    status: Mutex<ProcessStatus>,
    stop: CancellationToken,
}

impl ProcessHandle {
    fn new(command: &str, pid: Option<u32>) -> Self {
        Self {
            command: command.to_string(),
            status: Mutex::new(ProcessStatus {
                pid,
                exit: None,
                started_at: Utc::now(),
                stopped_at: None,
                termination: None,
            }),
            stop: CancellationToken::new(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn status(&self) -> ProcessStatus {
        self.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_running()
    }

    /// Ask the runner to kill the process now.
    ///
    /// Returns as soon as the request is registered; the runner records the
    /// exit once the process group is gone. A request that is accepted is
    /// always honoured: the run ends as [`Termination::Stopped`] even if the
    /// process exits on its own in the meantime.
    pub fn stop(&self) -> Result<(), ProcessError> {
        let status = self.lock();
        if !status.is_running() {
            return Err(ProcessError::NotRunning {
                command: self.command.clone(),
            });
        }
        self.stop.cancel();
        Ok(())
    }

    /// Record a natural exit. Returns `false`, leaving the status untouched,
    /// when a stop request got in first.
    fn record_exit(&self, exit: i32) -> bool {
        let mut status = self.lock();
        if self.stop.is_cancelled() {
            return false;
        }
        Self::mark(&mut status, exit, Termination::Exited);
        true
    }

    /// Record a kill. An accepted stop request takes precedence over the
    /// deadline so the caller that stopped the process sees it as stopped.
    fn record_kill(&self, termination: Termination) -> Termination {
        let mut status = self.lock();
        let termination = if self.stop.is_cancelled() {
            Termination::Stopped
        } else {
            termination
        };
        Self::mark(&mut status, KILLED_EXIT_CODE, termination);
        termination
    }

    fn finish(&self, exit: i32, termination: Termination) {
        Self::mark(&mut self.lock(), exit, termination);
    }

    fn mark(status: &mut ProcessStatus, exit: i32, termination: Termination) {
        status.exit = Some(exit);
        status.stopped_at = Some(Utc::now());
        status.termination = Some(termination);
    }

    fn lock(&self) -> MutexGuard<'_, ProcessStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Slot holding the process most recently started for a job.
///
/// The handle stays in place after the process exits so its status can still
/// be read; the next [`run`] replaces it.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    current: Arc<Mutex<Option<Arc<ProcessHandle>>>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently attached process, running or not.
    pub fn process(&self) -> Option<Arc<ProcessHandle>> {
        self.lock().clone()
    }

    /// The attached process, only if it is still running.
    pub fn live_process(&self) -> Option<Arc<ProcessHandle>> {
        self.process().filter(|handle| handle.is_running())
    }

    pub fn clear(&self) {
        self.lock().take();
    }

    fn attach(&self, handle: Arc<ProcessHandle>) {
        *self.lock() = Some(handle);
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<ProcessHandle>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Completion {
    Waited(io::Result<std::process::ExitStatus>),
    Killed(Termination),
}

/// Run `command` with `sh -c`, killing it when `timeout` elapses or when the
/// published handle is stopped. A zero timeout disables the deadline.
///
/// Returns stdout and stderr interleaved line by line.
pub async fn run(
    command: &str,
    timeout: Duration,
    ctx: &ExecutionContext,
) -> Result<String, ProcessError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        command: command.to_string(),
        source,
    })?;

    let handle = Arc::new(ProcessHandle::new(command, child.id()));
    ctx.attach(handle.clone());
    tracing::debug!(pid = ?child.id(), command, "process started");

    let output = Arc::new(Mutex::new(String::new()));
    let readers = [
        child
            .stdout
            .take()
            .map(|stream| collect_lines(stream, output.clone())),
        child
            .stderr
            .take()
            .map(|stream| collect_lines(stream, output.clone())),
    ];

    let deadline = async {
        if timeout.is_zero() {
            std::future::pending::<()>().await
        } else {
            tokio::time::sleep(timeout).await
        }
    };

    let completion = tokio::select! {
        status = child.wait() => Completion::Waited(status),
        _ = deadline => Completion::Killed(Termination::Deadline),
        _ = handle.stop.cancelled() => Completion::Killed(Termination::Stopped),
    };

    let termination = match completion {
        Completion::Waited(Ok(status)) => {
            let code = status.code();
            if handle.record_exit(code.unwrap_or(KILLED_EXIT_CODE)) {
                let output = drain(readers, &output).await;
                return if status.success() {
                    tracing::debug!(command, "process exited successfully");
                    Ok(output)
                } else {
                    tracing::debug!(command, exit_code = ?code, "process exited with failure");
                    Err(ProcessError::Exited {
                        command: command.to_string(),
                        code,
                        output,
                    })
                };
            }
            // exited while an accepted stop request was on its way
            Termination::Stopped
        }
        Completion::Waited(Err(source)) => {
            handle.finish(KILLED_EXIT_CODE, Termination::Exited);
            return Err(ProcessError::Wait {
                command: command.to_string(),
                source,
            });
        }
        Completion::Killed(termination) => {
            if let Err(error) = kill_group(&mut child) {
                tracing::warn!(%error, command, "failed to kill process");
            }
            if let Err(error) = child.wait().await {
                tracing::warn!(%error, command, "failed to reap killed process");
            }
            termination
        }
    };

    let termination = handle.record_kill(termination);
    let elapsed = handle.status().elapsed();
    tracing::warn!(
        command,
        elapsed_secs = elapsed.as_secs(),
        %termination,
        "process killed"
    );
    let output = drain(readers, &output).await;
    Err(ProcessError::Killed {
        command: command.to_string(),
        termination,
        elapsed,
        output,
    })
}

fn collect_lines<R>(stream: R, sink: Arc<Mutex<String>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut out = sink.lock().unwrap_or_else(PoisonError::into_inner);
            out.push_str(&line);
            out.push('\n');
        }
    })
}

async fn drain(readers: [Option<JoinHandle<()>>; 2], output: &Mutex<String>) -> String {
    for reader in readers.into_iter().flatten() {
        let abort = reader.abort_handle();
        if tokio::time::timeout(OUTPUT_DRAIN_GRACE, reader).await.is_err() {
            // a grandchild escaped the process group and still holds the pipe
            abort.abort();
        }
    }
    std::mem::take(&mut *output.lock().unwrap_or_else(PoisonError::into_inner))
}

#[cfg(unix)]
fn kill_group(child: &mut Child) -> io::Result<()> {
    if let Some(pid) = child.id() {
        // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
        // addresses the process group the child leads.
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
        if rc == 0 {
            return Ok(());
        }
        let error = io::Error::last_os_error();
        if error.raw_os_error() != Some(libc::ESRCH) {
            return Err(error);
        }
    }
    child.start_kill()
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}
