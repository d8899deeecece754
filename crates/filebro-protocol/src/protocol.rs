//! JSON-RPC 2.0 protocol types
//!
//! Uses serde for serialization - can swap to bincode/messagepack later.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// JSON-RPC 2.0 request ID (can be string or number)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(RequestId::Number(id)),
            method: method.into(),
            params,
        }
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// The named reason carried in `data.reason`, if any.
    pub fn reason(&self) -> Option<Reason> {
        self.data
            .as_ref()
            .and_then(|d| d.get("reason"))
            .and_then(|r| serde_json::from_value(r.clone()).ok())
    }
}

impl Response {
    pub fn success(id: Option<RequestId>, result: impl Into<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn error(id: Option<RequestId>, code: i32, message: impl Into<String>) -> Self {
        Self::error_with_data(id, code, message, None)
    }

    pub fn error_with_data(
        id: Option<RequestId>,
        code: i32,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }

    /// Error response carrying a named reason in `data.reason`.
    pub fn failure(
        id: Option<RequestId>,
        code: i32,
        reason: Reason,
        message: impl Into<String>,
    ) -> Self {
        Self::error_with_data(
            id,
            code,
            message,
            Some(serde_json::json!({ "reason": reason })),
        )
    }

    /// Error response whose code is derived from `reason`.
    pub fn for_reason(id: Option<RequestId>, reason: Reason, message: impl Into<String>) -> Self {
        Self::failure(id, reason.code(), reason, message)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }
}

// Standard JSON-RPC error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Application error codes
pub const NOT_FOUND: i32 = -32001;
pub const PERMISSION_DENIED: i32 = -32002;
pub const NOT_SUPPORTED: i32 = -32003;
pub const IO_FAILURE: i32 = -32004;
pub const INVALID_PATH: i32 = -32005;
pub const TASK_REJECTED: i32 = -32010;
pub const TASK_NOT_FOUND: i32 = -32011;

/// Named failure reasons reported to clients. Every failure the daemon
/// surfaces carries one of these, never a bare message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reason {
    NotFound,
    PermissionDenied,
    NotSupported,
    #[serde(rename = "IOFailure")]
    IoFailure,
    InvalidPath,
    SchedulerOverload,
    UnknownTaskType,
    InvalidParameters,
    WorkerCrash,
    TaskFailed,
    TaskNotFound,
    ProtocolViolation,
    ConnectionLost,
    Internal,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::PermissionDenied => "PermissionDenied",
            Self::NotSupported => "NotSupported",
            Self::IoFailure => "IOFailure",
            Self::InvalidPath => "InvalidPath",
            Self::SchedulerOverload => "SchedulerOverload",
            Self::UnknownTaskType => "UnknownTaskType",
            Self::InvalidParameters => "InvalidParameters",
            Self::WorkerCrash => "WorkerCrash",
            Self::TaskFailed => "TaskFailed",
            Self::TaskNotFound => "TaskNotFound",
            Self::ProtocolViolation => "ProtocolViolation",
            Self::ConnectionLost => "ConnectionLost",
            Self::Internal => "Internal",
        }
    }

    /// JSON-RPC error code reported alongside this reason.
    pub fn code(&self) -> i32 {
        match self {
            Self::NotFound => NOT_FOUND,
            Self::PermissionDenied => PERMISSION_DENIED,
            Self::NotSupported => NOT_SUPPORTED,
            Self::IoFailure => IO_FAILURE,
            Self::InvalidPath => INVALID_PATH,
            Self::SchedulerOverload | Self::UnknownTaskType | Self::InvalidParameters => {
                TASK_REJECTED
            }
            Self::TaskNotFound => TASK_NOT_FOUND,
            Self::ProtocolViolation => INVALID_REQUEST,
            Self::WorkerCrash | Self::TaskFailed | Self::ConnectionLost | Self::Internal => {
                INTERNAL_ERROR
            }
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method names understood by the daemon.
pub mod methods {
    pub const NAVIGATE: &str = "navigate";
    pub const NAVIGATE_HISTORY: &str = "navigate.history";
    pub const STAT: &str = "stat";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const TASK_START: &str = "task.start";
    pub const TASK_CANCEL: &str = "task.cancel";
    pub const TASK_STATUS: &str = "task.status";
    pub const TASK_LIST: &str = "task.list";
    pub const DRIVERS_LIST: &str = "drivers.list";
    pub const DAEMON_STATUS: &str = "daemon.status";
    pub const DISCONNECT: &str = "disconnect";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_success_serialization() {
        let resp = Response::success(Some(RequestId::Number(1)), "pong");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"result\":\"pong\""));
        assert!(json.contains("\"id\":1"));
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_response_failure_carries_reason() {
        let resp = Response::failure(
            Some(RequestId::Number(7)),
            NOT_SUPPORTED,
            Reason::NotSupported,
            "driver 'ftp' does not support list",
        );
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("-32003"));
        assert!(json.contains("\"reason\":\"NotSupported\""));

        let parsed: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.error.unwrap().reason(), Some(Reason::NotSupported));
    }

    #[test]
    fn test_reason_codes() {
        let resp = Response::for_reason(None, Reason::SchedulerOverload, "queue full");
        assert_eq!(resp.error.as_ref().unwrap().code, TASK_REJECTED);
        assert_eq!(Reason::InvalidPath.code(), INVALID_PATH);
        assert_eq!(Reason::ProtocolViolation.code(), INVALID_REQUEST);
    }

    #[test]
    fn test_io_failure_wire_name() {
        let json = serde_json::to_string(&Reason::IoFailure).unwrap();
        assert_eq!(json, "\"IOFailure\"");
        assert_eq!(Reason::IoFailure.to_string(), "IOFailure");
    }

    #[test]
    fn test_request_deserialization() {
        let json = r#"{"jsonrpc":"2.0","id":1,"method":"navigate","params":{"path":"/home"}}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert_eq!(req.method, "navigate");
        assert_eq!(req.id, Some(RequestId::Number(1)));
        assert_eq!(req.params["path"], "/home");
    }

    #[test]
    fn test_request_without_params_defaults_to_null() {
        let req: Request =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"a","method":"task.list"}"#).unwrap();
        assert!(req.params.is_null());
        assert_eq!(req.id, Some(RequestId::String("a".into())));
    }

    #[test]
    fn test_request_to_json_line() {
        let line = Request::new(3, "stat", serde_json::json!({"path": "/"}))
            .to_json_line()
            .unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"method\":\"stat\""));
    }
}
