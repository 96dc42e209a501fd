use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hookbridge::backends::{self, BackendType};
use hookbridge::core::{BackupController, HookConfig};
use hookbridge::logging::{self, LogConfig, LogLevel};
use hookbridge::{config, context, web};
use serde::Serialize;

/// How long Ctrl-C waits for a cancelled backup to unwind.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "hookbridge")]
#[command(about = "HTTP bridge that runs one backup at a time with pre/post hooks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./hookbridge.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the REST API server
    Serve(ServerArgs),
    /// Query a running bridge
    Status {
        #[arg(long, default_value = "http://127.0.0.1:7070")]
        url: String,
    },
    /// Print the effective configuration as TOML
    Config(ServerArgs),
}

#[derive(Args, Serialize)]
struct ServerArgs {
    /// REST API server listen ip address
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    listen_ip: Option<std::net::IpAddr>,

    /// REST API server listen port
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    listen_port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, value_enum)]
    log_level: Option<LogLevel>,

    /// Emit logs as JSON
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,

    /// Command to be executed before running the backup
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    pre_backup_command: Option<String>,

    /// Command to be executed after running the backup
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    post_backup_command: Option<String>,

    /// Max seconds a pre/post command or the backup may run before it is killed
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    pre_post_timeout: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, value_enum)]
    backend: Option<BackendType>,

    /// Shell backend: backup command, `{id}` is replaced by the backup id
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    backup_command: Option<String>,

    /// Shell backend: delete command, `{id}` is replaced by the backup id
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    delete_command: Option<String>,

    /// Simulated backend: seconds per backup
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulated_duration: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_file = cli.config.as_deref();

    match &cli.command {
        Commands::Serve(args) => {
            let config = config::AppConfig::new(config_file, Some(args))?;
            run_server(config).await.context("Failed to run server")?
        }
        Commands::Status { url } => run_status(url)
            .await
            .context("Failed to check status of the bridge")?,
        Commands::Config(args) => {
            let config = config::AppConfig::new(config_file, Some(args))?;
            print!(
                "{}",
                toml::to_string_pretty(&config).context("Failed to serialize config")?
            );
        }
    }

    Ok(())
}

async fn run_server(config: config::AppConfig) -> Result<()> {
    logging::init(LogConfig {
        json: config.json_logs,
        level: config.log_level,
    });

    let backend = backends::create_backend(&config);
    let controller = BackupController::new(backend, HookConfig::from_config(&config));
    controller
        .init()
        .await
        .context("Failed to initialize backend")?;

    let bind_addr = config.bind_addr();
    let ctx = context::AppContext::new(config, controller.clone());
    let server = Arc::new(web::WebServer::new(ctx, bind_addr));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
            controller.shutdown(SHUTDOWN_GRACE).await;
            signal_server.shutdown();
        }
    });

    server.start().await
}

async fn run_status(url: &str) -> Result<()> {
    let status: serde_json::Value = reqwest::get(format!("{}/status", url.trim_end_matches('/')))
        .await?
        .error_for_status()?
        .json()
        .await?;

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
