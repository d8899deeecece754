//! FileBro daemon entry point.

use anyhow::{Context, Result};
use clap::Parser;
use filebro_config::DaemonConfig;
use filebro_daemon::Server;
use filebro_drivers::DriverRegistry;
use filebro_protocol::{pid_path, remove_pid_file, write_pid_file};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "filebro-daemon", version, about = "FileBro backend daemon")]
struct Args {
    /// Configuration file (default: $XDG_CONFIG_HOME/filebro/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Unix socket path
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Number of worker processes
    #[arg(short, long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = DaemonConfig::load(args.config.as_deref())
        .await
        .context("loading configuration")?;
    if let Some(socket) = args.socket {
        config.server.socket_path = Some(socket);
    }
    if let Some(workers) = args.workers {
        config.scheduler.workers = Some(workers);
    }
    config.validate().context("validating configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = config.scheduler.worker_count(),
        "Starting FileBro daemon"
    );

    let pid_file = pid_path();
    write_pid_file(&pid_file)
        .with_context(|| format!("writing PID file {}", pid_file.display()))?;

    let result = serve(&config).await;
    remove_pid_file(&pid_file);
    result
}

async fn serve(config: &DaemonConfig) -> Result<()> {
    let server = Server::bind(config, DriverRegistry::with_local()).await?;
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.cancel();
    });
    server.run().await
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
}
