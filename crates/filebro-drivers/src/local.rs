//! Host filesystem driver.

use crate::capability::{CapabilitySet, DriverDescriptor};
use crate::driver::{sort_entries, ByteStream, ChangeStream, RawChange, StorageDriver};
use crate::error::{DriverError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filebro_protocol::{ChangeKind, Entry, EntryKind};
use futures::Stream;
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs::Metadata;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const LOCAL_SCHEME: &str = "local";

/// Driver implementing all five capabilities against the host filesystem.
pub struct LocalDriver {
    descriptor: DriverDescriptor,
}

impl LocalDriver {
    pub fn new() -> Self {
        Self::with_capabilities(CapabilitySet::all())
    }

    /// Local driver restricted to a subset of capabilities.
    pub fn with_capabilities(capabilities: CapabilitySet) -> Self {
        Self {
            descriptor: DriverDescriptor::new(LOCAL_SCHEME, capabilities),
        }
    }

    fn entry_from_metadata(name: String, metadata: &Metadata) -> Entry {
        let kind = if metadata.is_dir() {
            EntryKind::Directory
        } else if metadata.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };
        Entry {
            name,
            kind,
            size: if kind == EntryKind::File {
                metadata.len()
            } else {
                0
            },
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        }
    }

    fn name_of(path: &str) -> String {
        Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string())
    }

    fn convert_event(event: notify::Event) -> Vec<RawChange> {
        let kind = match event.kind {
            EventKind::Create(_) => ChangeKind::Created,
            EventKind::Modify(ModifyKind::Name(_)) => ChangeKind::Renamed,
            EventKind::Modify(_) | EventKind::Any => ChangeKind::Modified,
            EventKind::Remove(_) => ChangeKind::Deleted,
            EventKind::Access(_) | EventKind::Other => return Vec::new(),
        };
        event
            .paths
            .into_iter()
            .map(|p| RawChange::new(p.to_string_lossy(), kind))
            .collect()
    }
}

impl Default for LocalDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageDriver for LocalDriver {
    fn descriptor(&self) -> &DriverDescriptor {
        &self.descriptor
    }

    async fn list(&self, path: &str) -> Result<Vec<Entry>> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| DriverError::from_io(e, path))?;
        if !metadata.is_dir() {
            return Err(DriverError::InvalidPath(format!("{path} is not a directory")));
        }

        let mut dir = tokio::fs::read_dir(path)
            .await
            .map_err(|e| DriverError::from_io(e, path))?;
        let mut entries = Vec::new();
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| DriverError::from_io(e, path))?
        {
            let name = item.file_name().to_string_lossy().into_owned();
            // Follow symlinks; a dangling link is still listed.
            let metadata = match tokio::fs::metadata(item.path()).await {
                Ok(m) => m,
                Err(_) => match item.metadata().await {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(path = %item.path().display(), error = %e, "Skipping unreadable entry");
                        continue;
                    }
                },
            };
            entries.push(Self::entry_from_metadata(name, &metadata));
        }

        sort_entries(&mut entries);
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<Entry> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| DriverError::from_io(e, path))?;
        Ok(Self::entry_from_metadata(Self::name_of(path), &metadata))
    }

    async fn read(&self, path: &str) -> Result<ByteStream> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| DriverError::from_io(e, path))?;
        Ok(Box::pin(file))
    }

    async fn write(&self, path: &str, mut data: ByteStream) -> Result<u64> {
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| DriverError::from_io(e, path))?;
        let written = tokio::io::copy(&mut data, &mut file)
            .await
            .map_err(|e| DriverError::from_io(e, path))?;
        file.flush()
            .await
            .map_err(|e| DriverError::from_io(e, path))?;
        Ok(written)
    }

    async fn watch(&self, path: &str) -> Result<ChangeStream> {
        tokio::fs::metadata(path)
            .await
            .map_err(|e| DriverError::from_io(e, path))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                match result {
                    Ok(event) => {
                        for change in Self::convert_event(event) {
                            // Receiver gone means the watch was dropped.
                            let _ = tx.send(change);
                        }
                    }
                    Err(e) => warn!("Notify error: {}", e),
                }
            })?;
        watcher.watch(Path::new(path), RecursiveMode::NonRecursive)?;
        debug!(path = %path, "Added local watch");

        Ok(Box::pin(LocalWatch {
            _watcher: watcher,
            rx,
        }))
    }
}

/// Change stream owning the OS watcher; dropping it removes the watch.
struct LocalWatch {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<RawChange>,
}

impl Stream for LocalWatch {
    type Item = RawChange;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
