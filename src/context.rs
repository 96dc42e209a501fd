use std::sync::Arc;
use std::time::Instant;

use crate::config::AppConfig;
use crate::core::BackupController;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub controller: BackupController,
    pub started_at: Instant,
}

impl AppContext {
    pub fn new(config: AppConfig, controller: BackupController) -> Self {
        Self {
            config: Arc::new(config),
            controller,
            started_at: Instant::now(),
        }
    }
}
