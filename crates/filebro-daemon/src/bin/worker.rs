//! FileBro worker process.
//!
//! Spawned by the daemon's worker pool, one per slot. Instructions arrive
//! on stdin, records leave on stdout; logs go to stderr only.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    filebro_daemon::worker::run_worker(tokio::io::stdin(), tokio::io::stdout()).await
}
