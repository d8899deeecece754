//! Daemon lifecycle: paths, PID file, socket cleanup

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Environment variable overriding the daemon socket path.
pub const SOCKET_ENV: &str = "FILEBRO_SOCKET";

/// Get the socket path for the daemon
///
/// Priority:
/// 1. `FILEBRO_SOCKET` environment variable (if set)
/// 2. `$XDG_RUNTIME_DIR/filebro.sock` (if XDG_RUNTIME_DIR is set)
/// 3. `/tmp/filebro.sock` (fallback)
pub fn socket_path() -> PathBuf {
    if let Ok(path) = std::env::var(SOCKET_ENV) {
        return PathBuf::from(path);
    }
    dirs::runtime_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("filebro.sock")
}

pub fn remove_socket(path: &Path) {
    let _ = fs::remove_file(path);
}

/// Get the PID file path
pub fn pid_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::state_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("filebro")
        .join("daemon.pid")
}

/// Write PID file
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, std::process::id().to_string())
}

/// Remove PID file
pub fn remove_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}
