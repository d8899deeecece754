//! Session identity and the message type producers use to reach sessions.

use crate::events::ServerEvent;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifier of one connected client. Never reused within a daemon process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new() -> Self {
        Self(SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// An event addressed to a set of sessions.
///
/// The change watcher and the task scheduler send these to the session
/// manager's outbound multiplexer; recipients that are no longer connected
/// are skipped there.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub recipients: Vec<SessionId>,
    pub event: ServerEvent,
}

impl Outbound {
    pub fn new(recipients: Vec<SessionId>, event: ServerEvent) -> Self {
        Self { recipients, event }
    }

    pub fn to_session(session: SessionId, event: ServerEvent) -> Self {
        Self::new(vec![session], event)
    }
}
