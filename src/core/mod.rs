pub mod backend;
pub mod controller;
pub mod models;
pub mod process;

pub use backend::Backend;
pub use controller::{BackupController, Deletion, HookConfig, JobSlot};
pub use models::{BackupRecord, BackupStatus, JobOutcome, LastRun, Stage};
pub use process::{ExecutionContext, ProcessError, ProcessHandle, ProcessStatus, Termination};
