//! Task identities, states and the closed set of task types.

use crate::protocol::Reason;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Unique, monotonically assigned task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle state of a task. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Blake3,
}

/// A task type together with its validated parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum TaskSpec {
    /// Digest a single file.
    Hash {
        path: String,
        #[serde(default)]
        algorithm: HashAlgorithm,
    },
    /// Copy files or directory trees into a destination directory.
    Copy {
        sources: Vec<String>,
        destination: String,
    },
    /// Remove files or directory trees.
    Delete { paths: Vec<String> },
    /// Recursively count files, directories and bytes below a path.
    Scan { path: String },
}

impl TaskSpec {
    pub const TYPES: [&'static str; 4] = ["hash", "copy", "delete", "scan"];

    /// Parse a client's `(type, params)` pair.
    pub fn parse(task_type: &str, params: Value) -> Result<Self, AdmissionError> {
        if !Self::TYPES.contains(&task_type) {
            return Err(AdmissionError::UnknownTaskType(task_type.to_string()));
        }

        let spec: TaskSpec =
            serde_json::from_value(serde_json::json!({ "type": task_type, "params": params }))
                .map_err(|e| AdmissionError::InvalidParameters(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), AdmissionError> {
        fn non_empty(field: &str, value: &str) -> Result<(), AdmissionError> {
            if value.trim().is_empty() {
                return Err(AdmissionError::InvalidParameters(format!(
                    "'{field}' must not be empty"
                )));
            }
            Ok(())
        }

        match self {
            Self::Hash { path, .. } | Self::Scan { path } => non_empty("path", path),
            Self::Copy {
                sources,
                destination,
            } => {
                if sources.is_empty() {
                    return Err(AdmissionError::InvalidParameters(
                        "'sources' must list at least one path".into(),
                    ));
                }
                sources.iter().try_for_each(|s| non_empty("sources", s))?;
                non_empty("destination", destination)
            }
            Self::Delete { paths } => {
                if paths.is_empty() {
                    return Err(AdmissionError::InvalidParameters(
                        "'paths' must list at least one path".into(),
                    ));
                }
                paths.iter().try_for_each(|p| non_empty("paths", p))
            }
        }
    }

    pub fn task_type(&self) -> &'static str {
        match self {
            Self::Hash { .. } => "hash",
            Self::Copy { .. } => "copy",
            Self::Delete { .. } => "delete",
            Self::Scan { .. } => "scan",
        }
    }
}

/// What a worker receives for one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: TaskId,
    pub spec: TaskSpec,
}

/// Why a `task.start` request was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Invalid task parameters: {0}")]
    InvalidParameters(String),

    #[error("Task queue is at capacity ({capacity})")]
    SchedulerOverload { capacity: usize },
}

impl AdmissionError {
    pub fn reason(&self) -> Reason {
        match self {
            Self::UnknownTaskType(_) => Reason::UnknownTaskType,
            Self::InvalidParameters(_) => Reason::InvalidParameters,
            Self::SchedulerOverload { .. } => Reason::SchedulerOverload,
        }
    }
}
