//! Collapsing of raw changes observed within one debounce window.

use filebro_drivers::RawChange;
use filebro_protocol::{ChangeKind, PathChange};
use std::collections::HashMap;

/// Accumulates raw changes until the window closes.
///
/// Changes to the same path keep the dominant kind
/// (Deleted > Renamed > Modified > Created). Paths are reported in the order
/// they were first seen.
#[derive(Debug, Default)]
pub struct Coalescer {
    changes: Vec<PathChange>,
    index: HashMap<String, usize>,
}

/// Result of closing a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coalesced {
    /// Dominant kind across all paths.
    pub kind: ChangeKind,
    pub changes: Vec<PathChange>,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: RawChange) {
        match self.index.get(&change.path) {
            Some(&i) => {
                let existing = &mut self.changes[i];
                existing.kind = existing.kind.merge(change.kind);
            }
            None => {
                self.index.insert(change.path.clone(), self.changes.len());
                self.changes.push(PathChange {
                    path: change.path,
                    kind: change.kind,
                });
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Close the window, leaving the coalescer empty.
    pub fn take(&mut self) -> Option<Coalesced> {
        self.index.clear();
        let changes = std::mem::take(&mut self.changes);
        let kind = changes
            .iter()
            .map(|c| c.kind)
            .reduce(ChangeKind::merge)?;
        Some(Coalesced { kind, changes })
    }
}
