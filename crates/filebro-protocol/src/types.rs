//! Navigation and change types shared by drivers, the watcher and clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    Other,
}

/// One entry of a directory listing, or the result of `stat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Kind of a change observed under a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Renamed,
    Deleted,
}

impl ChangeKind {
    /// Rank used when coalescing: Deleted > Renamed > Modified > Created.
    pub fn dominance(&self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Modified => 1,
            Self::Renamed => 2,
            Self::Deleted => 3,
        }
    }

    /// The more specific of two kinds observed for the same path.
    pub fn merge(self, other: ChangeKind) -> ChangeKind {
        if other.dominance() > self.dominance() {
            other
        } else {
            self
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Renamed => "renamed",
            Self::Deleted => "deleted",
        }
    }
}

/// A coalesced change for one concrete path below a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathChange {
    pub path: String,
    pub kind: ChangeKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_kind_merge_keeps_dominant() {
        use ChangeKind::*;
        assert_eq!(Created.merge(Modified), Modified);
        assert_eq!(Modified.merge(Created), Modified);
        assert_eq!(Modified.merge(Deleted), Deleted);
        assert_eq!(Deleted.merge(Created), Deleted);
        assert_eq!(Renamed.merge(Modified), Renamed);
        assert_eq!(Renamed.merge(Deleted), Deleted);
    }

    #[test]
    fn test_entry_serialization() {
        let entry = Entry {
            name: "a.txt".into(),
            kind: EntryKind::File,
            size: 12,
            modified: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["kind"], "file");
        assert!(json.get("modified").is_none());
    }
}
