//! Durable snapshot storage.
//!
//! Each synchronized root keeps its last committed snapshot, keyed by root
//! identifier, plus an optional pending snapshot written during the commit
//! handshake. A pending snapshot that survives a crash or disconnect is
//! rolled forward on the next session instead of being re-diffed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use fsync_shared::{ContentHash, Snapshot};

use crate::errors::{Result, SyncError};

/// Persistence seam for committed and pending snapshots.
///
/// `save` must be atomic: a reader sees either the previous snapshot or the
/// new one, never a partial write.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, root_id: &str) -> Result<Option<Snapshot>>;
    async fn save(&self, root_id: &str, snapshot: &Snapshot) -> Result<()>;

    /// The snapshot of a commit in flight, if one was interrupted.
    async fn load_pending(&self, root_id: &str) -> Result<Option<Snapshot>>;
    async fn save_pending(&self, root_id: &str, snapshot: &Snapshot) -> Result<()>;
    async fn clear_pending(&self, root_id: &str) -> Result<()>;
}

/// File-backed store: one JSON document per root under a state directory,
/// replaced via write-to-temp plus rename.
pub struct JsonSnapshotStore {
    dir: PathBuf,
}

impl JsonSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn snapshot_path(&self, root_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_key(root_id)))
    }

    fn pending_path(&self, root_id: &str) -> PathBuf {
        self.dir.join(format!("{}.pending.json", file_key(root_id)))
    }

    async fn read_snapshot(&self, path: &Path) -> Result<Option<Snapshot>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)
                    .map_err(|e| SyncError::Store(format!("corrupt snapshot file: {e}")))?;
                if !snapshot.verify() {
                    return Err(SyncError::Store(format!(
                        "snapshot root hash mismatch in {}",
                        path.display()
                    )));
                }
                Ok(Some(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_snapshot(&self, path: &Path, snapshot: &Snapshot) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| SyncError::Store(format!("snapshot encode failed: {e}")))?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(
            "persisted snapshot {} seq {} to {}",
            snapshot.root_id,
            snapshot.seq,
            path.display()
        );
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for JsonSnapshotStore {
    async fn load(&self, root_id: &str) -> Result<Option<Snapshot>> {
        self.read_snapshot(&self.snapshot_path(root_id)).await
    }

    async fn save(&self, root_id: &str, snapshot: &Snapshot) -> Result<()> {
        self.write_snapshot(&self.snapshot_path(root_id), snapshot)
            .await
    }

    async fn load_pending(&self, root_id: &str) -> Result<Option<Snapshot>> {
        self.read_snapshot(&self.pending_path(root_id)).await
    }

    async fn save_pending(&self, root_id: &str, snapshot: &Snapshot) -> Result<()> {
        self.write_snapshot(&self.pending_path(root_id), snapshot)
            .await
    }

    async fn clear_pending(&self, root_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.pending_path(root_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Root identifiers are arbitrary strings; derive a stable filename from a
/// readable prefix plus a hash suffix so distinct roots never collide.
fn file_key(root_id: &str) -> String {
    let prefix: String = root_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(32)
        .collect();
    let digest = ContentHash::of(root_id.as_bytes()).to_hex();
    format!("{prefix}-{}", &digest[..12])
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemorySnapshotStore {
    committed: RwLock<HashMap<String, Snapshot>>,
    pending: RwLock<HashMap<String, Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, root_id: &str) -> Result<Option<Snapshot>> {
        Ok(self.committed.read().await.get(root_id).cloned())
    }

    async fn save(&self, root_id: &str, snapshot: &Snapshot) -> Result<()> {
        self.committed
            .write()
            .await
            .insert(root_id.to_string(), snapshot.clone());
        Ok(())
    }

    async fn load_pending(&self, root_id: &str) -> Result<Option<Snapshot>> {
        Ok(self.pending.read().await.get(root_id).cloned())
    }

    async fn save_pending(&self, root_id: &str, snapshot: &Snapshot) -> Result<()> {
        self.pending
            .write()
            .await
            .insert(root_id.to_string(), snapshot.clone());
        Ok(())
    }

    async fn clear_pending(&self, root_id: &str) -> Result<()> {
        self.pending.write().await.remove(root_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fsync_shared::{Entry, EntryKind, SnapshotBuilder};

    fn sample_snapshot(seq: u64) -> Snapshot {
        let mut b = SnapshotBuilder::new("root-a", seq);
        b.insert(Entry {
            path: "file.txt".to_string(),
            kind: EntryKind::File,
            size: 4,
            modified_at: Utc::now(),
            hash: ContentHash::of(b"data"),
            mode: 0o644,
            symlink_target: None,
        });
        b.finish()
    }

    #[tokio::test]
    async fn test_json_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::new(dir.path());

        assert!(store.load("root-a").await.unwrap().is_none());

        let snap = sample_snapshot(3);
        store.save("root-a", &snap).await.unwrap();
        let loaded = store.load("root-a").await.unwrap().unwrap();
        assert_eq!(loaded, snap);
    }

    #[tokio::test]
    async fn test_save_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::new(dir.path());

        store.save("root-a", &sample_snapshot(1)).await.unwrap();
        store.save("root-a", &sample_snapshot(2)).await.unwrap();
        assert_eq!(store.load("root-a").await.unwrap().unwrap().seq, 2);
    }

    #[tokio::test]
    async fn test_pending_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::new(dir.path());

        let snap = sample_snapshot(5);
        store.save_pending("root-a", &snap).await.unwrap();
        assert_eq!(store.load_pending("root-a").await.unwrap().unwrap().seq, 5);
        // Committed state is untouched by the pending marker.
        assert!(store.load("root-a").await.unwrap().is_none());

        store.clear_pending("root-a").await.unwrap();
        assert!(store.load_pending("root-a").await.unwrap().is_none());
        // Clearing twice is fine.
        store.clear_pending("root-a").await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_file_is_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::new(dir.path());

        store.save("root-a", &sample_snapshot(1)).await.unwrap();
        let path = store.snapshot_path("root-a");
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        assert!(matches!(
            store.load("root-a").await,
            Err(SyncError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_distinct_roots_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::new(dir.path());

        // Same sanitized prefix, different identifiers.
        let mut a = sample_snapshot(1);
        a.root_id = "data/root".to_string();
        let mut b = sample_snapshot(2);
        b.root_id = "data.root".to_string();

        store.save("data/root", &a).await.unwrap();
        store.save("data.root", &b).await.unwrap();
        assert_eq!(store.load("data/root").await.unwrap().unwrap().seq, 1);
        assert_eq!(store.load("data.root").await.unwrap().unwrap().seq, 2);
    }
}
