//! Directory-tree snapshotting.
//!
//! Walks a root directory and produces a content-addressed [`Snapshot`] of
//! every entry not excluded by the ignore rules. Two unmodified trees produce
//! identical snapshots: entries are path-sorted, file hashes cover the bytes,
//! symlinks hash their target string, and directories hash their sorted child
//! entry hashes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use fsync_shared::{ContentHash, ContentHasher, Entry, EntryKind, Snapshot, SnapshotBuilder};

use crate::errors::{Result, SyncError};
use crate::ignore::IgnoreSet;

/// Configuration for the snapshotter.
#[derive(Debug, Clone)]
pub struct SnapshotterConfig {
    /// Ignore rules, first match wins.
    pub ignore: IgnoreSet,
    /// Bound on concurrent file-hashing tasks, to avoid saturating disk I/O.
    pub max_hash_concurrency: usize,
}

impl Default for SnapshotterConfig {
    fn default() -> Self {
        Self {
            ignore: IgnoreSet::default(),
            max_hash_concurrency: 8,
        }
    }
}

/// Result of a walk: the snapshot plus the per-path access errors that were
/// recorded as `Missing` pseudo-entries instead of aborting the walk.
#[derive(Debug)]
pub struct SnapshotReport {
    pub snapshot: Snapshot,
    pub access_errors: Vec<SyncError>,
}

/// Stateless tree walker; nothing is retained across calls.
pub struct Snapshotter {
    config: SnapshotterConfig,
}

impl Snapshotter {
    pub fn new(config: SnapshotterConfig) -> Self {
        Self { config }
    }

    /// Walk `root` and produce a snapshot tagged with `root_id` and `seq`.
    pub async fn snapshot(
        &self,
        root: impl AsRef<Path>,
        root_id: &str,
        seq: u64,
    ) -> Result<SnapshotReport> {
        let root = root.as_ref();
        info!("snapshotting {:?} as root '{}' seq {}", root, root_id, seq);

        let mut access_errors = Vec::new();
        let mut files = Vec::new();
        let mut entries: BTreeMap<String, Entry> = BTreeMap::new();

        self.walk(root, &mut files, &mut entries, &mut access_errors)
            .await?;

        // Hash file contents on a bounded pool.
        let semaphore = Arc::new(Semaphore::new(self.config.max_hash_concurrency.max(1)));
        let mut tasks = Vec::with_capacity(files.len());
        for (rel_path, abs_path, size, modified_at, mode) in files {
            let semaphore = Arc::clone(&semaphore);
            tasks.push(tokio::spawn(async move {
                let hash = match semaphore.acquire_owned().await {
                    Ok(_permit) => hash_file(&abs_path).await,
                    // Only possible if the pool is torn down mid-walk; folds
                    // into the per-path access error handling below.
                    Err(_) => Err(std::io::Error::other("hash pool closed")),
                };
                (rel_path, abs_path, size, modified_at, mode, hash)
            }));
        }

        for task in tasks {
            let (rel_path, abs_path, size, modified_at, mode, hash) = task
                .await
                .map_err(|e| SyncError::Protocol(format!("hash task panicked: {e}")))?;
            match hash {
                Ok(hash) => {
                    entries.insert(
                        rel_path.clone(),
                        Entry {
                            path: rel_path,
                            kind: EntryKind::File,
                            size,
                            modified_at,
                            hash,
                            mode,
                            symlink_target: None,
                        },
                    );
                }
                Err(source) => {
                    warn!("file became unreadable during hashing: {:?}", abs_path);
                    entries.insert(rel_path.clone(), missing_entry(rel_path));
                    access_errors.push(SyncError::Access {
                        path: abs_path,
                        source,
                    });
                }
            }
        }

        hash_directories(&mut entries);

        let mut builder = SnapshotBuilder::new(root_id, seq);
        for entry in entries.into_values() {
            builder.insert(entry);
        }
        let snapshot = builder.finish();

        debug!(
            "snapshot of '{}' complete: {} entries, {} access errors, root hash {}",
            root_id,
            snapshot.len(),
            access_errors.len(),
            snapshot.root_hash
        );

        Ok(SnapshotReport {
            snapshot,
            access_errors,
        })
    }

    /// Breadth-first walk collecting metadata. Files are deferred for
    /// concurrent hashing; symlinks and directories are resolved in place.
    async fn walk(
        &self,
        root: &Path,
        files: &mut Vec<(String, PathBuf, u64, DateTime<Utc>, u32)>,
        entries: &mut BTreeMap<String, Entry>,
        access_errors: &mut Vec<SyncError>,
    ) -> Result<()> {
        let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut read_dir = match fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(source) => {
                    let rel = relative_path(root, &dir);
                    warn!("directory unreadable, recording as missing: {:?}", dir);
                    if !rel.is_empty() {
                        entries.insert(rel.clone(), missing_entry(rel));
                    }
                    access_errors.push(SyncError::Access { path: dir, source });
                    continue;
                }
            };

            loop {
                let dir_entry = match read_dir.next_entry().await {
                    Ok(Some(e)) => e,
                    Ok(None) => break,
                    Err(source) => {
                        access_errors.push(SyncError::Access {
                            path: dir.clone(),
                            source,
                        });
                        break;
                    }
                };

                let abs_path = dir_entry.path();
                let rel = relative_path(root, &abs_path);
                if self.config.ignore.matches(&rel) {
                    continue;
                }

                // Never dereference symlinks; cycles are impossible by
                // construction.
                let metadata = match fs::symlink_metadata(&abs_path).await {
                    Ok(m) => m,
                    Err(source) => {
                        entries.insert(rel.clone(), missing_entry(rel));
                        access_errors.push(SyncError::Access {
                            path: abs_path,
                            source,
                        });
                        continue;
                    }
                };

                let modified_at = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                let mode = permissions_mode(&metadata);

                if metadata.is_symlink() {
                    match fs::read_link(&abs_path).await {
                        Ok(target) => {
                            let target = target.to_string_lossy().into_owned();
                            entries.insert(
                                rel.clone(),
                                Entry {
                                    path: rel,
                                    kind: EntryKind::Symlink,
                                    size: target.len() as u64,
                                    modified_at,
                                    hash: ContentHash::of(target.as_bytes()),
                                    mode,
                                    symlink_target: Some(target),
                                },
                            );
                        }
                        Err(source) => {
                            entries.insert(rel.clone(), missing_entry(rel));
                            access_errors.push(SyncError::Access {
                                path: abs_path,
                                source,
                            });
                        }
                    }
                } else if metadata.is_dir() {
                    // Placeholder hash, filled in by hash_directories once
                    // all children are known.
                    entries.insert(
                        rel.clone(),
                        Entry {
                            path: rel,
                            kind: EntryKind::Directory,
                            size: 0,
                            modified_at,
                            hash: ContentHash::of(&[]),
                            mode,
                            symlink_target: None,
                        },
                    );
                    pending.push(abs_path);
                } else if metadata.is_file() {
                    files.push((rel, abs_path, metadata.len(), modified_at, mode));
                }
                // Sockets, fifos and the like are skipped.
            }
        }

        Ok(())
    }
}

/// Fill in directory hashes bottom-up: each directory hashes the sorted
/// (name, hash) list of its direct children. Also used when a merged
/// snapshot is rebuilt from a baseline plus a change plan.
pub(crate) fn hash_directories(entries: &mut BTreeMap<String, Entry>) {
    let mut dirs: Vec<String> = entries
        .iter()
        .filter(|(_, e)| e.kind == EntryKind::Directory)
        .map(|(p, _)| p.clone())
        .collect();
    // Deepest first so children are final before their parent hashes them.
    dirs.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));

    for dir in dirs {
        let prefix = format!("{dir}/");
        let mut hasher = ContentHasher::new();
        // BTreeMap range gives the children already path-sorted.
        for (path, entry) in entries.range(prefix.clone()..) {
            if !path.starts_with(&prefix) {
                break;
            }
            if path[prefix.len()..].contains('/') {
                continue; // not a direct child
            }
            hasher.update(path.as_bytes());
            hasher.update(entry.hash.as_bytes());
        }
        if let Some(entry) = entries.get_mut(&dir) {
            entry.hash = hasher.finalize();
        }
    }
}

fn missing_entry(rel_path: String) -> Entry {
    Entry {
        path: rel_path,
        kind: EntryKind::Missing,
        size: 0,
        modified_at: Utc::now(),
        hash: ContentHash::of(&[]),
        mode: 0,
        symlink_target: None,
    }
}

fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.join("/")
}

fn permissions_mode(metadata: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode()
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        0
    }
}

async fn hash_file(path: &Path) -> std::io::Result<ContentHash> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn write_tree(root: &Path) {
        fs::create_dir_all(root.join("sub/inner")).await.unwrap();
        fs::write(root.join("a.txt"), b"alpha").await.unwrap();
        fs::write(root.join("sub/b.txt"), b"beta").await.unwrap();
        fs::write(root.join("sub/inner/c.txt"), b"gamma")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_deterministic_snapshots() {
        let temp = TempDir::new().unwrap();
        write_tree(temp.path()).await;

        let snapshotter = Snapshotter::new(SnapshotterConfig::default());
        let s1 = snapshotter.snapshot(temp.path(), "r", 1).await.unwrap();
        let s2 = snapshotter.snapshot(temp.path(), "r", 1).await.unwrap();

        assert_eq!(s1.snapshot.root_hash, s2.snapshot.root_hash);
        assert_eq!(s1.snapshot.entries, s2.snapshot.entries);
        assert!(s1.access_errors.is_empty());
    }

    #[tokio::test]
    async fn test_entries_and_kinds() {
        let temp = TempDir::new().unwrap();
        write_tree(temp.path()).await;

        let snapshotter = Snapshotter::new(SnapshotterConfig::default());
        let report = snapshotter.snapshot(temp.path(), "r", 1).await.unwrap();
        let snapshot = report.snapshot;

        assert_eq!(snapshot.get("a.txt").unwrap().kind, EntryKind::File);
        assert_eq!(snapshot.get("sub").unwrap().kind, EntryKind::Directory);
        assert_eq!(snapshot.get("sub/inner/c.txt").unwrap().size, 5);
        assert_eq!(
            snapshot.get("a.txt").unwrap().hash,
            ContentHash::of(b"alpha")
        );
    }

    #[tokio::test]
    async fn test_ignore_rules_apply() {
        let temp = TempDir::new().unwrap();
        write_tree(temp.path()).await;
        fs::create_dir_all(temp.path().join("node_modules/pkg"))
            .await
            .unwrap();
        fs::write(temp.path().join("node_modules/pkg/x.js"), b"js")
            .await
            .unwrap();
        fs::write(temp.path().join("junk.tmp"), b"scratch")
            .await
            .unwrap();

        let snapshotter = Snapshotter::new(SnapshotterConfig::default());
        let report = snapshotter.snapshot(temp.path(), "r", 1).await.unwrap();

        assert!(report.snapshot.get("node_modules").is_none());
        assert!(report.snapshot.get("node_modules/pkg/x.js").is_none());
        assert!(report.snapshot.get("junk.tmp").is_none());
        assert!(report.snapshot.get("a.txt").is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_is_opaque() {
        let temp = TempDir::new().unwrap();
        write_tree(temp.path()).await;
        tokio::fs::symlink("a.txt", temp.path().join("link"))
            .await
            .unwrap();
        // A cycle: resolving this would never terminate.
        tokio::fs::symlink(temp.path(), temp.path().join("loop"))
            .await
            .unwrap();

        let snapshotter = Snapshotter::new(SnapshotterConfig::default());
        let report = snapshotter.snapshot(temp.path(), "r", 1).await.unwrap();

        let link = report.snapshot.get("link").unwrap();
        assert_eq!(link.kind, EntryKind::Symlink);
        assert_eq!(link.symlink_target.as_deref(), Some("a.txt"));
        assert_eq!(link.hash, ContentHash::of(b"a.txt"));

        let cycle = report.snapshot.get("loop").unwrap();
        assert_eq!(cycle.kind, EntryKind::Symlink);
        // The loop target's children were never walked through the link.
        assert!(report.snapshot.get("loop/a.txt").is_none());
    }

    #[tokio::test]
    async fn test_directory_hash_tracks_children() {
        let temp = TempDir::new().unwrap();
        write_tree(temp.path()).await;

        let snapshotter = Snapshotter::new(SnapshotterConfig::default());
        let before = snapshotter.snapshot(temp.path(), "r", 1).await.unwrap();

        fs::write(temp.path().join("sub/inner/c.txt"), b"changed")
            .await
            .unwrap();
        let after = snapshotter.snapshot(temp.path(), "r", 1).await.unwrap();

        assert_ne!(
            before.snapshot.get("sub").unwrap().hash,
            after.snapshot.get("sub").unwrap().hash
        );
        assert_ne!(before.snapshot.root_hash, after.snapshot.root_hash);
        // Sibling untouched.
        assert_eq!(
            before.snapshot.get("a.txt").unwrap().hash,
            after.snapshot.get("a.txt").unwrap().hash
        );
    }
}
