//! Error types for the change watcher.

use filebro_drivers::DriverError;
use filebro_protocol::Reason;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    /// Path resolution or the driver's watch operation failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("Session is not subscribed to '{0}'")]
    NotSubscribed(String),
}

pub type Result<T> = std::result::Result<T, WatchError>;

impl WatchError {
    pub fn reason(&self) -> Reason {
        match self {
            Self::Driver(e) => e.reason(),
            Self::NotSubscribed(_) => Reason::NotFound,
        }
    }
}
