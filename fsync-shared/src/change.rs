//! Change records produced by diffing two snapshots.

use serde::{Deserialize, Serialize};

use crate::model::Entry;

/// A single difference between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    Added { new: Entry },
    Modified { old: Entry, new: Entry },
    Deleted { old: Entry },
    /// A moved file: same content hash and size, different path. Carries both
    /// entries so no bytes need to be re-transferred.
    Renamed { from: Entry, to: Entry },
}

impl Change {
    /// Path this change applies to (destination path for renames).
    pub fn path(&self) -> &str {
        match self {
            Change::Added { new } => &new.path,
            Change::Modified { new, .. } => &new.path,
            Change::Deleted { old } => &old.path,
            Change::Renamed { to, .. } => &to.path,
        }
    }

    /// Resulting entry after applying the change, if any survives.
    pub fn result(&self) -> Option<&Entry> {
        match self {
            Change::Added { new } => Some(new),
            Change::Modified { new, .. } => Some(new),
            Change::Deleted { .. } => None,
            Change::Renamed { to, .. } => Some(to),
        }
    }

    /// Whether applying this change requires transferring file content.
    /// Deletions and renames move no bytes; neither do directory or
    /// metadata-only changes.
    pub fn needs_bytes(&self) -> bool {
        match self {
            Change::Added { new } => new.is_file(),
            Change::Modified { old, new } => new.is_file() && old.hash != new.hash,
            Change::Deleted { .. } | Change::Renamed { .. } => false,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Change::Added { .. } => "added",
            Change::Modified { .. } => "modified",
            Change::Deleted { .. } => "deleted",
            Change::Renamed { .. } => "renamed",
        }
    }
}

/// Ordered sequence of changes between two snapshots.
///
/// Sorted by path on construction and never mutated afterwards; a new set is
/// computed per sync round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new(mut changes: Vec<Change>) -> Self {
        changes.sort_by(|a, b| a.path().cmp(b.path()));
        Self { changes }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn find(&self, path: &str) -> Option<&Change> {
        self.changes.iter().find(|c| c.path() == path)
    }

    /// Counts per change kind, in the order added/modified/deleted/renamed.
    pub fn stats(&self) -> ChangeStats {
        let mut stats = ChangeStats::default();
        for change in &self.changes {
            match change {
                Change::Added { .. } => stats.added += 1,
                Change::Modified { .. } => stats.modified += 1,
                Change::Deleted { .. } => stats.deleted += 1,
                Change::Renamed { .. } => stats.renamed += 1,
            }
        }
        stats
    }
}

impl IntoIterator for ChangeSet {
    type Item = Change;
    type IntoIter = std::vec::IntoIter<Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStats {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub renamed: usize,
}

impl ChangeStats {
    pub fn total(&self) -> usize {
        self.added + self.modified + self.deleted + self.renamed
    }
}

/// Divergent concurrent edits to the same path on both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub path: String,
    pub local: Change,
    pub remote: Change,
    /// Common-baseline entry both sides diverged from, if it existed.
    pub baseline: Option<Entry>,
}

/// Outcome chosen for a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Decision {
    KeepLocal,
    KeepRemote,
    /// Keep both versions; the losing side is written under `renamed_path`.
    KeepBothRenamed { renamed_path: String },
    Skip,
}
