//! Daemon <-> worker process protocol.
//!
//! Both directions are newline-delimited JSON. The worker reads
//! [`WorkerInstruction`]s from stdin and writes [`WorkerRecord`]s to stdout.
//! For every `run` the worker emits zero or more `progress`/`log` records
//! followed by exactly one terminal record (`result`, `error` or `cancelled`).

use crate::task::{TaskDescriptor, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerInstruction {
    Run { task: TaskDescriptor },
    Cancel { task_id: TaskId },
}

impl WorkerInstruction {
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRecord {
    Progress {
        task_id: TaskId,
        sequence: u64,
        percent: f32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Log {
        task_id: TaskId,
        sequence: u64,
        message: String,
    },
    Result {
        task_id: TaskId,
        payload: Value,
    },
    Error {
        task_id: TaskId,
        reason: String,
    },
    /// Acknowledges a cancel instruction; terminal.
    Cancelled { task_id: TaskId },
}

impl WorkerRecord {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Progress { task_id, .. }
            | Self::Log { task_id, .. }
            | Self::Result { task_id, .. }
            | Self::Error { task_id, .. }
            | Self::Cancelled { task_id } => *task_id,
        }
    }

    /// Sequence number of streaming records; terminal records have none.
    pub fn sequence(&self) -> Option<u64> {
        match self {
            Self::Progress { sequence, .. } | Self::Log { sequence, .. } => Some(*sequence),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.sequence().is_none()
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;

    #[test]
    fn test_instruction_wire_format() {
        let run = WorkerInstruction::Run {
            task: TaskDescriptor {
                id: TaskId(3),
                spec: TaskSpec::Scan { path: "/data".into() },
            },
        };
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["op"], "run");
        assert_eq!(json["task"]["id"], 3);
        assert_eq!(json["task"]["spec"]["type"], "scan");
        assert_eq!(json["task"]["spec"]["params"]["path"], "/data");

        let cancel = WorkerInstruction::Cancel { task_id: TaskId(3) };
        let line = cancel.to_json_line().unwrap();
        assert_eq!(line, "{\"op\":\"cancel\",\"task_id\":3}\n");
    }

    #[test]
    fn test_record_classification() {
        let progress: WorkerRecord = serde_json::from_str(
            r#"{"type":"progress","task_id":1,"sequence":4,"percent":50.0}"#,
        )
        .unwrap();
        assert_eq!(progress.task_id(), TaskId(1));
        assert_eq!(progress.sequence(), Some(4));
        assert!(!progress.is_terminal());

        let result: WorkerRecord =
            serde_json::from_str(r#"{"type":"result","task_id":1,"payload":{"digest":"ab"}}"#)
                .unwrap();
        assert!(result.is_terminal());

        let cancelled: WorkerRecord =
            serde_json::from_str(r#"{"type":"cancelled","task_id":1}"#).unwrap();
        assert!(cancelled.is_terminal());
    }
}
