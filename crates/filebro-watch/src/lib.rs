//! Change watcher for FileBro.
//!
//! Bridges driver watch streams to debounced `change` events addressed to
//! the sessions subscribed to each path.

mod coalesce;
mod error;
mod watcher;

pub use coalesce::{Coalesced, Coalescer};
pub use error::{Result, WatchError};
pub use watcher::ChangeWatcher;
