//! The storage driver contract.

use crate::capability::{Capability, DriverDescriptor};
use crate::error::{DriverError, Result};
use async_trait::async_trait;
use filebro_protocol::{ChangeKind, Entry};
use futures::stream::BoxStream;
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Byte stream returned by `read` and consumed by `write`.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Lazy, unbounded sequence of raw change notifications. Dropping the
/// stream cancels the underlying watch.
pub type ChangeStream = BoxStream<'static, RawChange>;

/// Change reported by a driver before coalescing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    pub path: String,
    pub kind: ChangeKind,
}

impl RawChange {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// One storage backend (local disk, ftp, sftp, ...).
///
/// Operations outside the declared capability set keep their default body,
/// which fails with `NotSupported`. The registry gates calls on the
/// descriptor before they ever reach a driver.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn descriptor(&self) -> &DriverDescriptor;

    /// Directory entries sorted by name.
    async fn list(&self, path: &str) -> Result<Vec<Entry>> {
        let _ = path;
        Err(DriverError::unsupported(
            &self.descriptor().scheme,
            Capability::List,
        ))
    }

    async fn stat(&self, path: &str) -> Result<Entry> {
        let _ = path;
        Err(DriverError::unsupported(
            &self.descriptor().scheme,
            Capability::Stat,
        ))
    }

    async fn read(&self, path: &str) -> Result<ByteStream> {
        let _ = path;
        Err(DriverError::unsupported(
            &self.descriptor().scheme,
            Capability::Read,
        ))
    }

    /// Write the whole stream to `path`, returning the number of bytes written.
    async fn write(&self, path: &str, data: ByteStream) -> Result<u64> {
        let _ = (path, data);
        Err(DriverError::unsupported(
            &self.descriptor().scheme,
            Capability::Write,
        ))
    }

    async fn watch(&self, path: &str) -> Result<ChangeStream> {
        let _ = path;
        Err(DriverError::unsupported(
            &self.descriptor().scheme,
            Capability::Watch,
        ))
    }
}

/// Sort entries the way every driver returns them.
pub fn sort_entries(entries: &mut [Entry]) {
    entries.sort_by(|a, b| a.name.cmp(&b.name));
}
