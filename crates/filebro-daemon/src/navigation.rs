//! Navigation history and start-up directory.

use filebro_config::NavigationConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct NavigationState {
    #[serde(default)]
    last_directory: Option<String>,
    #[serde(default)]
    history: Vec<String>,
}

/// Daemon-wide record of visited directories, most recent last.
pub struct NavigationHistory {
    state: Mutex<NavigationState>,
    limit: usize,
    state_file: Option<PathBuf>,
    start_up_directory: Option<String>,
    start_up_from_last: bool,
    /// Serializes writes of the state file.
    persist_lock: tokio::sync::Mutex<()>,
}

impl NavigationHistory {
    /// Build from configuration, reloading persisted state when enabled.
    pub async fn load(config: &NavigationConfig) -> Self {
        let state_file = config.save_history.then(|| config.state_file());
        let state = match &state_file {
            Some(path) => read_state(path).await,
            None => NavigationState::default(),
        };

        let mut history = Self {
            state: Mutex::new(state),
            limit: config.history_limit.max(1),
            state_file,
            start_up_directory: config.start_up_directory.clone(),
            start_up_from_last: config.start_up_from_last_directory,
            persist_lock: tokio::sync::Mutex::new(()),
        };
        history.trim();
        history
    }

    fn trim(&mut self) {
        let limit = self.limit;
        let state = self.state.get_mut();
        let excess = state.history.len().saturating_sub(limit);
        state.history.drain(..excess);
    }

    /// Record a successful navigation to `path`.
    pub async fn record(&self, path: &str) {
        {
            let mut state = self.state.lock();
            if state.history.last().map(String::as_str) != Some(path) {
                state.history.push(path.to_string());
                let excess = state.history.len().saturating_sub(self.limit);
                state.history.drain(..excess);
            }
            state.last_directory = Some(path.to_string());
        }
        self.persist().await;
    }

    pub fn entries(&self) -> Vec<String> {
        self.state.lock().history.clone()
    }

    pub fn last_directory(&self) -> Option<String> {
        self.state.lock().last_directory.clone()
    }

    /// Where a navigation without an explicit path goes.
    pub fn start_up_directory(&self) -> String {
        if self.start_up_from_last {
            if let Some(last) = self.last_directory() {
                return last;
            }
        }
        self.start_up_directory
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "/".to_string())
    }

    async fn persist(&self) {
        let Some(path) = &self.state_file else {
            return;
        };
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.state.lock().clone();
        if let Err(e) = write_state(path, &snapshot).await {
            warn!(path = %path.display(), error = %e, "Failed to save navigation history");
        }
    }
}

async fn read_state(path: &Path) -> NavigationState {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable navigation state");
                NavigationState::default()
            }
        },
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No navigation state loaded");
            NavigationState::default()
        }
    }
}

async fn write_state(path: &Path, state: &NavigationState) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
