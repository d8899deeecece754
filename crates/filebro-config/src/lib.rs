//! # FileBro Configuration
//!
//! Type-safe configuration for the daemon. Every field has a default, so an
//! empty or missing file yields a working configuration.
//!
//! Resolution order:
//! 1. built-in defaults
//! 2. TOML file (`--config`, else `$XDG_CONFIG_HOME/filebro/config.toml` if present)
//! 3. environment overrides (`FILEBRO_SOCKET`, `FILEBRO_WORKERS`)
//!
//! ```toml
//! [scheduler]
//! workers = 4
//! cancel_grace_ms = 2000
//!
//! [watch]
//! debounce_ms = 150
//! ```

mod components;

pub use components::{
    NavigationConfig, SchedulerConfig, ServerConfig, SessionConfig, WatchConfig,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable overriding the worker slot count.
pub const WORKERS_ENV: &str = "FILEBRO_WORKERS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub watch: WatchConfig,
    pub scheduler: SchedulerConfig,
    pub navigation: NavigationConfig,
}

impl DaemonConfig {
    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("filebro").join("config.toml"))
    }

    /// Load configuration, apply environment overrides and validate.
    ///
    /// An explicit `path` must exist; the default location is optional.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path).await?,
            None => match Self::default_path() {
                Some(default) if default.is_file() => Self::load_from_file(&default).await?,
                _ => {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(socket) = lookup(filebro_protocol::SOCKET_ENV) {
            self.server.socket_path = Some(PathBuf::from(socket));
        }
        if let Some(workers) = lookup(WORKERS_ENV) {
            let count = workers.trim().parse::<usize>().map_err(|e| ConfigError::Invalid {
                key: WORKERS_ENV,
                message: e.to_string(),
            })?;
            self.scheduler.workers = Some(count);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        fn positive(key: &'static str, value: u64) -> Result<()> {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    message: "must be greater than zero".into(),
                });
            }
            Ok(())
        }

        positive(
            "session.outbound_queue_capacity",
            self.session.outbound_queue_capacity as u64,
        )?;
        positive("watch.debounce_ms", self.watch.debounce_ms)?;
        positive("watch.poll_interval_ms", self.watch.poll_interval_ms)?;
        positive("scheduler.queue_capacity", self.scheduler.queue_capacity as u64)?;
        positive("scheduler.cancel_grace_ms", self.scheduler.cancel_grace_ms)?;
        positive("scheduler.workers", self.scheduler.worker_count() as u64)?;
        positive("navigation.history_limit", self.navigation.history_limit as u64)?;
        if self.server.tcp_port.is_some() {
            positive("server.port_range", self.server.port_range as u64)?;
        }
        Ok(())
    }
}
