//! Remote (ftp/sftp) driver over a pluggable transport.
//!
//! The wire protocol lives behind [`RemoteTransport`]; this module only maps
//! the driver contract onto it and supplies a polling watch.

use crate::capability::{Capability, CapabilitySet, DriverDescriptor};
use crate::driver::{sort_entries, ByteStream, ChangeStream, StorageDriver};
use crate::error::{DriverError, Result};
use crate::polling::{Lister, PollingWatch};
use async_trait::async_trait;
use filebro_protocol::Entry;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Parsed `scheme://[user@]host[:port]/path` location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLocation {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub path: String,
}

impl RemoteLocation {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| DriverError::InvalidPath(format!("{raw}: {e}")))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DriverError::InvalidPath(format!("{raw}: missing host")))?
            .to_string();
        let user = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let path = match url.path() {
            "" => "/".to_string(),
            p => p.to_string(),
        };

        Ok(Self {
            scheme: url.scheme().to_string(),
            host,
            port: url.port(),
            user,
            path,
        })
    }
}

/// Wire-level access to one remote protocol.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn list(&self, location: &RemoteLocation) -> Result<Vec<Entry>>;

    async fn stat(&self, location: &RemoteLocation) -> Result<Entry>;

    async fn read(&self, location: &RemoteLocation) -> Result<ByteStream>;

    async fn write(&self, location: &RemoteLocation, data: ByteStream) -> Result<u64>;
}

pub struct RemoteDriver {
    descriptor: DriverDescriptor,
    transport: Arc<dyn RemoteTransport>,
    poll_interval: Option<Duration>,
}

impl RemoteDriver {
    /// Driver for `scheme` supporting list, stat, read and write.
    pub fn new(scheme: impl Into<String>, transport: Arc<dyn RemoteTransport>) -> Self {
        let capabilities = CapabilitySet::all().without(Capability::Watch);
        Self {
            descriptor: DriverDescriptor::new(scheme, capabilities),
            transport,
            poll_interval: None,
        }
    }

    /// Declare the watch capability, served by polling every `interval`.
    pub fn with_polling_watch(mut self, interval: Duration) -> Self {
        self.descriptor.capabilities = self.descriptor.capabilities.with(Capability::Watch);
        self.poll_interval = Some(interval);
        self
    }

    fn locate(&self, path: &str) -> Result<RemoteLocation> {
        let location = RemoteLocation::parse(path)?;
        if !location.scheme.eq_ignore_ascii_case(&self.descriptor.scheme) {
            return Err(DriverError::InvalidPath(format!(
                "{path} is not a {} location",
                self.descriptor.scheme
            )));
        }
        Ok(location)
    }
}

#[async_trait]
impl StorageDriver for RemoteDriver {
    fn descriptor(&self) -> &DriverDescriptor {
        &self.descriptor
    }

    async fn list(&self, path: &str) -> Result<Vec<Entry>> {
        let location = self.locate(path)?;
        let mut entries = self.transport.list(&location).await?;
        sort_entries(&mut entries);
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<Entry> {
        let location = self.locate(path)?;
        self.transport.stat(&location).await
    }

    async fn read(&self, path: &str) -> Result<ByteStream> {
        let location = self.locate(path)?;
        self.transport.read(&location).await
    }

    async fn write(&self, path: &str, data: ByteStream) -> Result<u64> {
        let location = self.locate(path)?;
        self.transport.write(&location, data).await
    }

    async fn watch(&self, path: &str) -> Result<ChangeStream> {
        let interval = self
            .poll_interval
            .ok_or_else(|| DriverError::unsupported(&self.descriptor.scheme, Capability::Watch))?;
        let location = self.locate(path)?;
        let transport = self.transport.clone();
        let lister: Lister = Arc::new(move || -> BoxFuture<'static, Result<Vec<Entry>>> {
            let transport = transport.clone();
            let location = location.clone();
            Box::pin(async move { transport.list(&location).await })
        });

        let watch = PollingWatch::start(path.to_string(), interval, lister).await?;
        Ok(Box::pin(watch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filebro_protocol::{ChangeKind, EntryKind};
    use futures::StreamExt;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tokio::io::AsyncReadExt;

    /// In-memory transport: directory path -> files with contents.
    #[derive(Default)]
    struct MemoryTransport {
        dirs: Mutex<HashMap<String, Vec<(String, Vec<u8>)>>>,
    }

    impl MemoryTransport {
        fn put(&self, dir: &str, name: &str, data: &[u8]) {
            self.dirs
                .lock()
                .entry(dir.to_string())
                .or_default()
                .push((name.to_string(), data.to_vec()));
        }

        fn remove_dir(&self, dir: &str) {
            self.dirs.lock().remove(dir);
        }

        fn split(path: &str) -> (String, String) {
            let (dir, name) = path.rsplit_once('/').unwrap_or(("", path));
            let dir = if dir.is_empty() { "/" } else { dir };
            (dir.to_string(), name.to_string())
        }
    }

    #[async_trait]
    impl RemoteTransport for MemoryTransport {
        async fn list(&self, location: &RemoteLocation) -> Result<Vec<Entry>> {
            let dirs = self.dirs.lock();
            let files = dirs
                .get(&location.path)
                .ok_or_else(|| DriverError::NotFound(location.path.clone()))?;
            Ok(files
                .iter()
                .map(|(name, data)| Entry {
                    name: name.clone(),
                    kind: EntryKind::File,
                    size: data.len() as u64,
                    modified: None,
                })
                .collect())
        }

        async fn stat(&self, location: &RemoteLocation) -> Result<Entry> {
            let (dir, name) = Self::split(&location.path);
            let parent = RemoteLocation {
                path: dir,
                ..location.clone()
            };
            self.list(&parent)
                .await?
                .into_iter()
                .find(|e| e.name == name)
                .ok_or_else(|| DriverError::NotFound(location.path.clone()))
        }

        async fn read(&self, location: &RemoteLocation) -> Result<ByteStream> {
            let (dir, name) = Self::split(&location.path);
            let dirs = self.dirs.lock();
            let data = dirs
                .get(&dir)
                .and_then(|files| files.iter().find(|(n, _)| *n == name))
                .map(|(_, d)| d.clone())
                .ok_or_else(|| DriverError::NotFound(location.path.clone()))?;
            Ok(Box::pin(std::io::Cursor::new(data)))
        }

        async fn write(&self, location: &RemoteLocation, mut data: ByteStream) -> Result<u64> {
            let mut buf = Vec::new();
            data.read_to_end(&mut buf)
                .await
                .map_err(|e| DriverError::IoFailure(e.to_string()))?;
            let (dir, name) = Self::split(&location.path);
            self.put(&dir, &name, &buf);
            Ok(buf.len() as u64)
        }
    }

    #[test]
    fn test_parse_location() {
        let loc = RemoteLocation::parse("sftp://alice@example.org:2222/srv/data").unwrap();
        assert_eq!(loc.scheme, "sftp");
        assert_eq!(loc.host, "example.org");
        assert_eq!(loc.port, Some(2222));
        assert_eq!(loc.user.as_deref(), Some("alice"));
        assert_eq!(loc.path, "/srv/data");

        let loc = RemoteLocation::parse("ftp://mirror").unwrap();
        assert_eq!(loc.path, "/");
        assert!(loc.user.is_none());
    }

    #[tokio::test]
    async fn test_list_sorted_and_read_back() {
        let transport = Arc::new(MemoryTransport::default());
        transport.put("/pub", "z.iso", b"zz");
        transport.put("/pub", "a.txt", b"hello");
        let driver = RemoteDriver::new("ftp", transport);

        let names: Vec<_> = driver
            .list("ftp://mirror/pub")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a.txt", "z.iso"]);

        let mut reader = driver.read("ftp://mirror/pub/a.txt").await.unwrap();
        let mut content = String::new();
        reader.read_to_string(&mut content).await.unwrap();
        assert_eq!(content, "hello");

        let entry = driver.stat("ftp://mirror/pub/z.iso").await.unwrap();
        assert_eq!(entry.size, 2);
    }

    #[tokio::test]
    async fn test_scheme_mismatch_is_invalid_path() {
        let driver = RemoteDriver::new("ftp", Arc::new(MemoryTransport::default()));
        assert!(matches!(
            driver.list("sftp://host/x").await,
            Err(DriverError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_without_polling_is_not_supported() {
        let driver = RemoteDriver::new("ftp", Arc::new(MemoryTransport::default()));
        assert!(!driver.descriptor().supports(Capability::Watch));
        assert!(matches!(
            driver.watch("ftp://mirror/pub").await,
            Err(DriverError::NotSupported(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_watch_reports_changes_and_ends_on_removal() {
        let transport = Arc::new(MemoryTransport::default());
        transport.put("/pub", "a.txt", b"a");
        let driver = RemoteDriver::new("sftp", transport.clone())
            .with_polling_watch(Duration::from_secs(2));
        assert!(driver.descriptor().supports(Capability::Watch));

        let mut changes = driver.watch("sftp://host/pub").await.unwrap();

        transport.put("/pub", "b.txt", b"b");
        let change = changes.next().await.unwrap();
        assert_eq!(change.path, "sftp://host/pub/b.txt");
        assert_eq!(change.kind, ChangeKind::Created);

        transport.remove_dir("/pub");
        assert!(changes.next().await.is_none());
    }

    #[tokio::test]
    async fn test_watch_missing_directory_fails_upfront() {
        let driver = RemoteDriver::new("sftp", Arc::new(MemoryTransport::default()))
            .with_polling_watch(Duration::from_millis(10));
        assert!(matches!(
            driver.watch("sftp://host/none").await,
            Err(DriverError::NotFound(_))
        ));
    }
}
