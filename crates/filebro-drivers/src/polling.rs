//! Watch implementation for backends without native change notification.
//!
//! The directory is listed every interval and consecutive snapshots are
//! diffed into Created/Modified/Deleted changes. The stream ends when the
//! watched directory disappears.

use crate::driver::RawChange;
use crate::error::{DriverError, Result};
use filebro_protocol::{ChangeKind, Entry};
use futures::future::BoxFuture;
use futures::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lists the watched directory once.
pub type Lister = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<Entry>>> + Send + Sync>;

type Snapshot = BTreeMap<String, Entry>;

/// Change stream backed by a polling task. Dropping it stops the task.
pub struct PollingWatch {
    rx: mpsc::UnboundedReceiver<RawChange>,
    task: JoinHandle<()>,
}

impl PollingWatch {
    /// Take the initial snapshot, then poll in the background.
    ///
    /// Fails immediately if the first listing fails, so a watch on a missing
    /// path reports `NotFound` to the subscriber.
    pub async fn start(base: String, interval: Duration, lister: Lister) -> Result<Self> {
        let initial = snapshot(lister().await?);
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let mut previous = initial;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                let current = match lister().await {
                    Ok(entries) => snapshot(entries),
                    Err(DriverError::NotFound(_)) => {
                        debug!(path = %base, "Polled directory disappeared");
                        break;
                    }
                    Err(e) => {
                        warn!(path = %base, error = %e, "Poll failed");
                        continue;
                    }
                };
                for change in diff_snapshots(&base, &previous, &current) {
                    if tx.send(change).is_err() {
                        return;
                    }
                }
                previous = current;
            }
        });

        Ok(Self { rx, task })
    }
}

impl Stream for PollingWatch {
    type Item = RawChange;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for PollingWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn snapshot(entries: Vec<Entry>) -> Snapshot {
    entries.into_iter().map(|e| (e.name.clone(), e)).collect()
}

fn join(base: &str, name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), name)
}

/// Changes between two listings of `base`, in name order.
pub(crate) fn diff_snapshots(base: &str, old: &Snapshot, new: &Snapshot) -> Vec<RawChange> {
    let mut changes = Vec::new();
    for (name, entry) in new {
        match old.get(name) {
            None => changes.push(RawChange::new(join(base, name), ChangeKind::Created)),
            Some(prev) if prev.size != entry.size || prev.modified != entry.modified => {
                changes.push(RawChange::new(join(base, name), ChangeKind::Modified))
            }
            Some(_) => {}
        }
    }
    for name in old.keys().filter(|n| !new.contains_key(*n)) {
        changes.push(RawChange::new(join(base, name), ChangeKind::Deleted));
    }
    changes
}
