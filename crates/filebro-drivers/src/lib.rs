//! Storage drivers for FileBro.
//!
//! A driver serves one storage scheme and declares which of the five
//! operations (list, stat, read, write, watch) it supports. The
//! [`DriverRegistry`] resolves client paths to drivers and refuses any
//! operation outside a driver's declared capabilities before touching the
//! backend.

pub mod capability;
pub mod driver;
pub mod error;
pub mod local;
pub mod polling;
pub mod registry;
pub mod remote;

pub use capability::{Capability, CapabilitySet, DriverDescriptor};
pub use driver::{sort_entries, ByteStream, ChangeStream, RawChange, StorageDriver};
pub use error::{DriverError, Result};
pub use local::{LocalDriver, LOCAL_SCHEME};
pub use polling::{Lister, PollingWatch};
pub use registry::{DriverRegistry, NavigationHandle};
pub use remote::{RemoteDriver, RemoteLocation, RemoteTransport};
