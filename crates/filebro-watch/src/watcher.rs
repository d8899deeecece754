//! Per-path watch subscriptions shared between sessions.
//!
//! The first subscribe to a path opens the driver watch and spawns a pump
//! task that debounces the raw stream and sends one `change` event per
//! window to every session currently interested in the path. When the last
//! session leaves, the subscription is removed and the pump is cancelled,
//! which drops the driver stream and thereby the underlying watch.

use crate::coalesce::Coalescer;
use crate::error::{Result, WatchError};
use filebro_drivers::{ChangeStream, DriverRegistry, NavigationHandle};
use filebro_protocol::{Outbound, ServerEvent, SessionId};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Clients = Arc<RwLock<HashSet<SessionId>>>;
type SubscriptionTable = Arc<Mutex<HashMap<NavigationHandle, Subscription>>>;

struct Subscription {
    /// Never empty while the subscription is in the table.
    clients: Clients,
    cancel: CancellationToken,
    generation: u64,
}

/// Bridges driver watch streams to debounced broadcasts.
pub struct ChangeWatcher {
    registry: Arc<DriverRegistry>,
    subscriptions: SubscriptionTable,
    outbound: mpsc::UnboundedSender<Outbound>,
    debounce: Duration,
    generation: AtomicU64,
}

impl ChangeWatcher {
    pub fn new(
        registry: Arc<DriverRegistry>,
        outbound: mpsc::UnboundedSender<Outbound>,
        debounce: Duration,
    ) -> Self {
        Self {
            registry,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            outbound,
            debounce,
            generation: AtomicU64::new(1),
        }
    }

    /// Add `session` to the subscription for `path`, creating it if needed.
    ///
    /// Returns the resolved path that change events will carry.
    pub async fn subscribe(&self, session: SessionId, path: &str) -> Result<String> {
        let handle = self.registry.resolve(path)?;
        if self.join_existing(&handle, session) {
            debug!(session_id = %session, path = %handle, "Joined existing watch");
            return Ok(handle.path);
        }

        let stream = self.registry.watch(&handle).await?;

        let mut table = self.subscriptions.lock();
        // Another session may have opened the same watch while we awaited.
        if let Some(existing) = table.get(&handle) {
            existing.clients.write().insert(session);
            return Ok(handle.path);
        }

        let clients: Clients = Arc::new(RwLock::new(HashSet::from([session])));
        let cancel = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        table.insert(
            handle.clone(),
            Subscription {
                clients: clients.clone(),
                cancel: cancel.clone(),
                generation,
            },
        );
        drop(table);

        let pump = Pump {
            handle: handle.clone(),
            clients,
            cancel,
            generation,
            debounce: self.debounce,
            outbound: self.outbound.clone(),
            table: self.subscriptions.clone(),
        };
        tokio::spawn(pump.run(stream));

        info!(session_id = %session, path = %handle, "Opened watch");
        Ok(handle.path)
    }

    fn join_existing(&self, handle: &NavigationHandle, session: SessionId) -> bool {
        let table = self.subscriptions.lock();
        match table.get(handle) {
            Some(sub) => {
                sub.clients.write().insert(session);
                true
            }
            None => false,
        }
    }

    /// Remove `session` from the subscription for `path`, tearing the
    /// subscription down if it was the last client.
    pub fn unsubscribe(&self, session: SessionId, path: &str) -> Result<()> {
        let handle = self.registry.resolve(path)?;
        let mut table = self.subscriptions.lock();
        let removed = table
            .get(&handle)
            .map(|sub| sub.clients.write().remove(&session))
            .unwrap_or(false);
        if !removed {
            return Err(WatchError::NotSubscribed(handle.path));
        }
        release_if_empty(&mut table, &handle);
        debug!(session_id = %session, path = %handle, "Unsubscribed");
        Ok(())
    }

    /// Drop `session` from every subscription. Returns how many it held.
    pub fn remove_session(&self, session: SessionId) -> usize {
        let mut table = self.subscriptions.lock();
        let held: Vec<NavigationHandle> = table
            .iter()
            .filter(|(_, sub)| sub.clients.write().remove(&session))
            .map(|(handle, _)| handle.clone())
            .collect();
        for handle in &held {
            release_if_empty(&mut table, handle);
        }
        if !held.is_empty() {
            debug!(session_id = %session, count = held.len(), "Released session watches");
        }
        held.len()
    }

    /// Paths `session` is subscribed to.
    pub fn subscriptions_of(&self, session: SessionId) -> Vec<String> {
        let table = self.subscriptions.lock();
        let mut paths: Vec<String> = table
            .iter()
            .filter(|(_, sub)| sub.clients.read().contains(&session))
            .map(|(handle, _)| handle.path.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Sessions subscribed to the already-resolved `path`.
    pub fn clients_of(&self, path: &str) -> Vec<SessionId> {
        let table = self.subscriptions.lock();
        let mut clients: Vec<SessionId> = table
            .iter()
            .find(|(handle, _)| handle.path == path)
            .map(|(_, sub)| sub.clients.read().iter().copied().collect())
            .unwrap_or_default();
        clients.sort();
        clients
    }

    pub fn active_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Cancel every watch.
    pub fn shutdown(&self) {
        let mut table = self.subscriptions.lock();
        for (_, sub) in table.drain() {
            sub.cancel.cancel();
        }
    }
}

fn release_if_empty(table: &mut HashMap<NavigationHandle, Subscription>, handle: &NavigationHandle) {
    let empty = table
        .get(handle)
        .map(|sub| sub.clients.read().is_empty())
        .unwrap_or(false);
    if empty {
        if let Some(sub) = table.remove(handle) {
            sub.cancel.cancel();
            info!(path = %handle, "Closed watch");
        }
    }
}

/// Background task owning one driver stream.
struct Pump {
    handle: NavigationHandle,
    clients: Clients,
    cancel: CancellationToken,
    generation: u64,
    debounce: Duration,
    outbound: mpsc::UnboundedSender<Outbound>,
    table: SubscriptionTable,
}

impl Pump {
    async fn run(self, mut stream: ChangeStream) {
        let mut pending = Coalescer::new();

        loop {
            let first = tokio::select! {
                _ = self.cancel.cancelled() => return,
                change = stream.next() => change,
            };
            let Some(first) = first else { break };
            pending.push(first);

            // The window opens at the first change and has a fixed length.
            let window = tokio::time::sleep(self.debounce);
            tokio::pin!(window);
            let mut ended = false;
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return,
                    _ = &mut window => break,
                    change = stream.next() => match change {
                        Some(change) => pending.push(change),
                        None => {
                            ended = true;
                            break;
                        }
                    },
                }
            }

            self.flush(&mut pending);
            if ended {
                break;
            }
        }

        self.end("driver watch stream ended");
    }

    fn recipients(&self) -> Vec<SessionId> {
        self.clients.read().iter().copied().collect()
    }

    fn flush(&self, pending: &mut Coalescer) {
        let Some(coalesced) = pending.take() else {
            return;
        };
        let recipients = self.recipients();
        if recipients.is_empty() {
            return;
        }
        debug!(
            path = %self.handle,
            kind = coalesced.kind.as_str(),
            paths = coalesced.changes.len(),
            "Broadcasting change"
        );
        let event = ServerEvent::Change {
            path: self.handle.path.clone(),
            kind: coalesced.kind,
            changes: coalesced.changes,
        };
        if self.outbound.send(Outbound::new(recipients, event)).is_err() {
            warn!(path = %self.handle, "Outbound channel closed");
        }
    }

    /// Remove our own subscription and tell its clients the watch is gone.
    fn end(&self, reason: &str) {
        let removed = {
            let mut table = self.table.lock();
            match table.get(&self.handle) {
                Some(sub) if sub.generation == self.generation => table.remove(&self.handle),
                _ => None,
            }
        };
        let Some(sub) = removed else { return };

        let recipients: Vec<SessionId> = sub.clients.read().iter().copied().collect();
        info!(path = %self.handle, reason, "Watch ended");
        let event = ServerEvent::WatchEnded {
            path: self.handle.path.clone(),
            reason: reason.to_string(),
        };
        let _ = self.outbound.send(Outbound::new(recipients, event));
    }
}
