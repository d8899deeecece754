//! Daemon Event Protocol (async notifications from daemon to client)

use crate::protocol::Reason;
use crate::task::{TaskId, TaskState};
use crate::types::{ChangeKind, PathChange};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload of a `task_progress` event: a percentage or a log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Progress {
    Percent {
        percent: f32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Log(String),
}

/// Server-initiated event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Debounced change below a subscribed path. `kind` is the dominant
    /// kind across `changes`.
    Change {
        path: String,
        kind: ChangeKind,
        changes: Vec<PathChange>,
    },
    TaskState {
        task_id: TaskId,
        state: TaskState,
    },
    TaskProgress {
        task_id: TaskId,
        sequence: u64,
        progress: Progress,
    },
    TaskResult {
        task_id: TaskId,
        payload: Value,
    },
    TaskError {
        task_id: TaskId,
        reason: Reason,
        message: String,
    },
    /// The driver watch behind a subscription terminated; clients may
    /// subscribe again to restart it.
    WatchEnded {
        path: String,
        reason: String,
    },
}

impl ServerEvent {
    /// Task this event belongs to, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::TaskState { task_id, .. }
            | Self::TaskProgress { task_id, .. }
            | Self::TaskResult { task_id, .. }
            | Self::TaskError { task_id, .. } => Some(*task_id),
            Self::Change { .. } | Self::WatchEnded { .. } => None,
        }
    }

    pub fn is_task_terminal(&self) -> bool {
        matches!(self, Self::TaskResult { .. } | Self::TaskError { .. })
            || matches!(self, Self::TaskState { state, .. } if state.is_terminal())
    }
}

/// Wire envelope for a [`ServerEvent`]; no response is expected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Message type (always "event")
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(flatten)]
    pub event: ServerEvent,
}

impl EventMessage {
    pub fn new(event: ServerEvent) -> Self {
        Self {
            msg_type: "event".to_string(),
            event,
        }
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }
}

impl From<ServerEvent> for EventMessage {
    fn from(event: ServerEvent) -> Self {
        Self::new(event)
    }
}
