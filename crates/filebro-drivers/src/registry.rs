//! Driver registry and path resolution.
//!
//! The registry is populated once at startup and then shared read-only
//! behind an `Arc`. Every operation is gated on the target driver's declared
//! capabilities before the driver is called.

use crate::capability::{Capability, DriverDescriptor};
use crate::driver::{ByteStream, ChangeStream, StorageDriver};
use crate::error::{DriverError, Result};
use crate::local::{LocalDriver, LOCAL_SCHEME};
use filebro_protocol::Entry;
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// A (driver, path) pair resolved for one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NavigationHandle {
    pub scheme: String,
    /// Path in the form the driver expects: an absolute filesystem path for
    /// the local driver, the full `scheme://...` location otherwise.
    pub path: String,
}

impl NavigationHandle {
    pub fn new(scheme: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            path: path.into(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.scheme == LOCAL_SCHEME
    }
}

impl fmt::Display for NavigationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Append-only table of drivers keyed by scheme.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn StorageDriver>>,
    order: Vec<String>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding only the local filesystem driver.
    pub fn with_local() -> Self {
        let mut registry = Self::new();
        // A fresh registry cannot already hold "local".
        let _ = registry.register(Arc::new(LocalDriver::new()));
        registry
    }

    pub fn register(&mut self, driver: Arc<dyn StorageDriver>) -> Result<()> {
        let scheme = driver.descriptor().scheme.to_ascii_lowercase();
        if self.drivers.contains_key(&scheme) {
            return Err(DriverError::AlreadyRegistered(scheme));
        }
        info!(
            scheme = %scheme,
            capabilities = ?driver.descriptor().capabilities,
            "Registered driver"
        );
        self.order.push(scheme.clone());
        self.drivers.insert(scheme, driver);
        Ok(())
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn StorageDriver>> {
        self.drivers.get(scheme).cloned()
    }

    /// Descriptors in registration order.
    pub fn descriptors(&self) -> Vec<DriverDescriptor> {
        self.order
            .iter()
            .filter_map(|s| self.drivers.get(s))
            .map(|d| d.descriptor().clone())
            .collect()
    }

    /// Resolve a client-supplied path to a driver and a driver path.
    ///
    /// `scheme://rest` selects the driver for `scheme` (`file://` is the
    /// local driver). Otherwise a leading `~` is expanded and an absolute
    /// path maps to the local driver.
    pub fn resolve(&self, raw: &str) -> Result<NavigationHandle> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(DriverError::InvalidPath("empty path".into()));
        }

        if let Some((scheme, _)) = split_scheme(raw) {
            let scheme = scheme.to_ascii_lowercase();
            if scheme == "file" {
                let url = url::Url::parse(raw)
                    .map_err(|e| DriverError::InvalidPath(format!("{raw}: {e}")))?;
                let path = url
                    .to_file_path()
                    .map_err(|_| DriverError::InvalidPath(raw.to_string()))?;
                return self.local_handle(&path);
            }
            if !self.drivers.contains_key(&scheme) {
                return Err(DriverError::NotSupported(format!(
                    "no driver registered for scheme '{scheme}'"
                )));
            }
            return Ok(NavigationHandle::new(scheme, raw));
        }

        let expanded = expand_tilde(raw)?;
        if !expanded.is_absolute() {
            return Err(DriverError::InvalidPath(format!(
                "{raw} is neither absolute nor a scheme URL"
            )));
        }
        self.local_handle(&expanded)
    }

    fn local_handle(&self, path: &Path) -> Result<NavigationHandle> {
        if !self.drivers.contains_key(LOCAL_SCHEME) {
            return Err(DriverError::NotSupported(
                "no driver registered for local paths".into(),
            ));
        }
        let normalized = normalize(path);
        Ok(NavigationHandle::new(
            LOCAL_SCHEME,
            normalized.to_string_lossy().into_owned(),
        ))
    }

    /// The driver behind `handle`, provided it declares `capability`.
    pub fn driver_for(
        &self,
        handle: &NavigationHandle,
        capability: Capability,
    ) -> Result<Arc<dyn StorageDriver>> {
        let driver = self.get(&handle.scheme).ok_or_else(|| {
            DriverError::NotSupported(format!(
                "no driver registered for scheme '{}'",
                handle.scheme
            ))
        })?;
        if !driver.descriptor().supports(capability) {
            debug!(scheme = %handle.scheme, capability = %capability, "Rejected unsupported operation");
            return Err(DriverError::unsupported(&handle.scheme, capability));
        }
        Ok(driver)
    }

    pub async fn list(&self, handle: &NavigationHandle) -> Result<Vec<Entry>> {
        self.driver_for(handle, Capability::List)?
            .list(&handle.path)
            .await
    }

    pub async fn stat(&self, handle: &NavigationHandle) -> Result<Entry> {
        self.driver_for(handle, Capability::Stat)?
            .stat(&handle.path)
            .await
    }

    pub async fn read(&self, handle: &NavigationHandle) -> Result<ByteStream> {
        self.driver_for(handle, Capability::Read)?
            .read(&handle.path)
            .await
    }

    pub async fn write(&self, handle: &NavigationHandle, data: ByteStream) -> Result<u64> {
        self.driver_for(handle, Capability::Write)?
            .write(&handle.path, data)
            .await
    }

    pub async fn watch(&self, handle: &NavigationHandle) -> Result<ChangeStream> {
        self.driver_for(handle, Capability::Watch)?
            .watch(&handle.path)
            .await
    }
}

fn split_scheme(raw: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = raw.split_once("://")?;
    let valid = !scheme.is_empty()
        && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some((scheme, rest))
}

fn expand_tilde(raw: &str) -> Result<PathBuf> {
    let rest = match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => return Ok(PathBuf::from(raw)),
    };
    let home = dirs::home_dir()
        .ok_or_else(|| DriverError::InvalidPath("home directory is unknown".into()))?;
    Ok(home.join(rest.trim_start_matches('/')))
}

/// Lexically collapse `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
