//! Concrete [`Backend`] implementations selectable from the configuration.

mod shell;
mod simulated;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::core::Backend;

pub use shell::ShellBackend;
pub use simulated::SimulatedBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Run a configured shell command per backup.
    Shell,
    /// Pretend to back up by sleeping.
    Simulated,
}

pub fn create_backend(config: &AppConfig) -> Arc<dyn Backend> {
    match config.backend {
        BackendType::Shell => Arc::new(ShellBackend::new(
            config.backup_command.clone().unwrap_or_default(),
            config.delete_command.clone(),
            config.pre_post_timeout(),
        )),
        BackendType::Simulated => Arc::new(SimulatedBackend::new(Duration::from_secs(
            config.simulated_duration,
        ))),
    }
}
