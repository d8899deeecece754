//! Error types for storage drivers.

use crate::capability::Capability;
use filebro_protocol::Reason;
use std::io;
use thiserror::Error;

/// Errors surfaced by driver operations. Never retried by the driver layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Capability absent or scheme unknown; raised before any I/O.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Transient backend failure.
    #[error("I/O failure: {0}")]
    IoFailure(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Driver already registered for scheme '{0}'")]
    AlreadyRegistered(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;

impl DriverError {
    pub fn unsupported(scheme: &str, capability: Capability) -> Self {
        Self::NotSupported(format!("driver '{scheme}' does not support {capability}"))
    }

    /// Classify an I/O error raised while touching `path`.
    pub fn from_io(err: io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_string()),
            _ => Self::IoFailure(format!("{path}: {err}")),
        }
    }

    pub fn reason(&self) -> Reason {
        match self {
            Self::NotFound(_) => Reason::NotFound,
            Self::PermissionDenied(_) => Reason::PermissionDenied,
            Self::NotSupported(_) => Reason::NotSupported,
            Self::IoFailure(_) => Reason::IoFailure,
            Self::InvalidPath(_) => Reason::InvalidPath,
            Self::AlreadyRegistered(_) => Reason::Internal,
        }
    }
}

/// Convert notify errors to our error type.
impl From<notify::Error> for DriverError {
    fn from(err: notify::Error) -> Self {
        let path = err
            .paths
            .first()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        match err.kind {
            notify::ErrorKind::PathNotFound => Self::NotFound(path),
            notify::ErrorKind::Io(io_err) => Self::from_io(io_err, &path),
            other => Self::IoFailure(format!("watch {path}: {other:?}")),
        }
    }
}
