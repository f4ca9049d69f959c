//! Canonical file-tree data model shared by client and server.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::{ContentHash, ContentHasher};

/// Kind of a file-system object recorded in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    /// Opaque symlink; the target string is stored and hashed, never followed.
    Symlink,
    /// Pseudo-entry for a path that became unreadable mid-walk.
    Missing,
}

/// One file-system object.
///
/// Paths are relative to the synchronized root, `/`-separated and
/// case-sensitive on every platform. A path is unique within a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    /// Content hash: file bytes for files, target string for symlinks,
    /// sorted child entry hashes for directories.
    pub hash: ContentHash,
    /// Unix permission bits (zero where unavailable).
    pub mode: u32,
    /// Symlink target, present only for `EntryKind::Symlink`.
    pub symlink_target: Option<String>,
}

impl Entry {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// File name component of the path.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Immutable point-in-time record of a directory tree.
///
/// Entries are kept in a path-sorted map so that diffing and root hashing are
/// deterministic: two unmodified trees always produce identical snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Identifier of the synchronized root this snapshot belongs to.
    pub root_id: String,
    /// Monotonically increasing sequence number; bumped on every commit.
    pub seq: u64,
    pub entries: BTreeMap<String, Entry>,
    /// Hash over the sorted entry hash list.
    pub root_hash: ContentHash,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// Empty snapshot at sequence zero, the implicit baseline of a root that
    /// has never been synchronized.
    pub fn empty(root_id: impl Into<String>) -> Self {
        SnapshotBuilder::new(root_id, 0).finish()
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total size of all file entries.
    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    /// Recompute the root hash and compare against the stored one.
    pub fn verify(&self) -> bool {
        compute_root_hash(&self.entries) == self.root_hash
    }
}

/// Builder producing a finalized [`Snapshot`].
pub struct SnapshotBuilder {
    root_id: String,
    seq: u64,
    entries: BTreeMap<String, Entry>,
}

impl SnapshotBuilder {
    pub fn new(root_id: impl Into<String>, seq: u64) -> Self {
        Self {
            root_id: root_id.into(),
            seq,
            entries: BTreeMap::new(),
        }
    }

    /// Insert an entry, replacing any previous entry at the same path.
    pub fn insert(&mut self, entry: Entry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    pub fn finish(self) -> Snapshot {
        let root_hash = compute_root_hash(&self.entries);
        Snapshot {
            root_id: self.root_id,
            seq: self.seq,
            entries: self.entries,
            root_hash,
            created_at: Utc::now(),
        }
    }
}

fn compute_root_hash(entries: &BTreeMap<String, Entry>) -> ContentHash {
    // BTreeMap iterates path-sorted, giving a deterministic root hash.
    let mut hasher = ContentHasher::new();
    for entry in entries.values() {
        hasher.update(entry.path.as_bytes());
        hasher.update(entry.hash.as_bytes());
    }
    hasher.finalize()
}
