//! Configuration sections.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Listener configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Unix socket path; `None` uses the platform default.
    pub socket_path: Option<PathBuf>,
    /// Optional loopback TCP listener. The first free port in
    /// `[tcp_port, tcp_port + port_range)` is bound.
    pub tcp_port: Option<u16>,
    pub port_range: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            tcp_port: None,
            port_range: 10,
        }
    }
}

impl ServerConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(filebro_protocol::socket_path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Events buffered per client before the oldest are dropped.
    pub outbound_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub debounce_ms: u64,
    /// Interval for polling watches of drivers without native notifications.
    pub poll_interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            poll_interval_ms: 2000,
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker slot count; `None` uses the detected CPU parallelism.
    pub workers: Option<usize>,
    pub queue_capacity: usize,
    pub cancel_grace_ms: u64,
    /// Consecutive restarts allowed per slot before it is degraded.
    pub restart_budget: u32,
    /// Worker executable; `None` uses `filebro-worker` next to the daemon.
    pub worker_program: Option<PathBuf>,
    pub worker_args: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: None,
            queue_capacity: 1024,
            cancel_grace_ms: 3000,
            restart_budget: 3,
            worker_program: None,
            worker_args: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn worker_program(&self) -> PathBuf {
        if let Some(program) = &self.worker_program {
            return program.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BINARY)))
            .unwrap_or_else(|| PathBuf::from(WORKER_BINARY))
    }
}

const WORKER_BINARY: &str = "filebro-worker";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    pub start_up_directory: Option<String>,
    pub start_up_from_last_directory: bool,
    pub save_history: bool,
    pub history_limit: usize,
    /// Where navigation state is persisted; `None` uses the platform state dir.
    pub state_dir: Option<PathBuf>,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            start_up_directory: None,
            start_up_from_last_directory: true,
            save_history: true,
            history_limit: 100,
            state_dir: None,
        }
    }
}

impl NavigationConfig {
    pub fn state_file(&self) -> PathBuf {
        self.state_dir
            .clone()
            .or_else(|| dirs::state_dir().map(|d| d.join("filebro")))
            .or_else(|| dirs::data_local_dir().map(|d| d.join("filebro")))
            .unwrap_or_else(|| PathBuf::from("/tmp/filebro"))
            .join("navigation.json")
    }
}
