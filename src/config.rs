use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::backends::BackendType;
use crate::logging::LogLevel;

pub const DEFAULT_CONFIG_FILE: &str = "hookbridge.toml";
pub const ENV_PREFIX: &str = "HOOKBRIDGE_";
pub const DEFAULT_PRE_POST_TIMEOUT_SECS: u64 = 7200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub listen_ip: IpAddr,
    pub listen_port: u16,
    pub log_level: LogLevel,
    pub json_logs: bool,

    pub pre_backup_command: Option<String>,
    pub post_backup_command: Option<String>,
    /// Seconds a hook or the backend backup may run before being killed.
    pub pre_post_timeout: u64,

    pub backend: BackendType,
    /// Shell backend: command creating a backup, `{id}` is replaced by the backup id.
    pub backup_command: Option<String>,
    /// Shell backend: command removing a backup, `{id}` as above.
    pub delete_command: Option<String>,
    /// Simulated backend: seconds each backup takes.
    pub simulated_duration: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 7070,
            log_level: LogLevel::Info,
            json_logs: false,
            pre_backup_command: None,
            post_backup_command: None,
            pre_post_timeout: DEFAULT_PRE_POST_TIMEOUT_SECS,
            backend: BackendType::Shell,
            backup_command: None,
            delete_command: None,
            simulated_duration: 5,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `HOOKBRIDGE_*` variables and CLI
    /// overrides, later layers winning.
    ///
    /// A missing config file is not an error.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let path = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment
            .extract()
            .with_context(|| format!("Failed to load configuration (file: {})", path.display()))
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }

    pub fn pre_post_timeout(&self) -> Duration {
        Duration::from_secs(self.pre_post_timeout)
    }
}
