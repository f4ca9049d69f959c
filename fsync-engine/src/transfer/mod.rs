//! Chunked, resumable file content transfer.
//!
//! One [`TransferManager`] lives per session side. The sender plans a block
//! sequence against the receiver's signature and streams it with a bounded
//! in-flight window; the receiver assembles into a staging file, verifies the
//! whole-file hash and renames into place. Both sides keep per-file state so
//! an interrupted transfer resumes from the first unacknowledged block after
//! reconnect instead of restarting.

pub mod delta;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use fsync_shared::{BlockAck, BlockData, BlockPayload, ContentHash, Entry, Message, Signature};

use crate::errors::{Result, SyncError};
use crate::progress::ProgressTracker;
use crate::transport::{recv_message, send_message, Transport};

pub use delta::DEFAULT_BLOCK_SIZE;

/// How many blocks may be unacknowledged at once.
pub const DEFAULT_WINDOW: usize = 8;

/// Whole-file integrity retransmits before a file is reported failed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub block_size: u32,
    pub window: usize,
    pub max_retries: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            window: DEFAULT_WINDOW,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Receiver-side buffer of one file in flight.
struct PartialFile {
    payloads: Vec<Option<BlockPayload>>,
    attempts: u32,
}

impl PartialFile {
    fn sized(total: u32) -> Self {
        Self {
            payloads: vec![None; total as usize],
            attempts: 0,
        }
    }

    fn first_missing(&self) -> Option<u32> {
        self.payloads
            .iter()
            .position(Option::is_none)
            .map(|i| i as u32)
    }
}

/// What the receiver should do after absorbing one block.
enum BlockOutcome {
    /// Ack the block and keep receiving.
    Continue { ack_index: u32 },
    /// A block or ordering problem; nack `index` so the sender rewinds.
    Reject { index: u32, reason: &'static str },
    /// All blocks present; try assembly.
    Complete,
}

pub struct TransferManager {
    root: PathBuf,
    config: TransferConfig,
    /// Sender side: contiguous acknowledged block count per path.
    acked: HashMap<String, u32>,
    /// Receiver side: blocks received so far per path.
    partial: HashMap<String, PartialFile>,
}

impl TransferManager {
    pub fn new(root: impl Into<PathBuf>, config: TransferConfig) -> Self {
        Self {
            root: root.into(),
            config,
            acked: HashMap::new(),
            partial: HashMap::new(),
        }
    }

    pub fn block_size(&self) -> u32 {
        self.config.block_size
    }

    fn abs(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Send one file's content. `signature` describes the receiver's current
    /// content at the path, enabling block reuse. Returns the literal bytes
    /// put on the wire by this call. A transport failure leaves resume state
    /// behind; calling again with a reconnected transport picks up at the
    /// first unacknowledged block.
    pub async fn send_file(
        &mut self,
        transport: &mut dyn Transport,
        entry: &Entry,
        signature: Option<&Signature>,
        progress: &Arc<ProgressTracker>,
    ) -> Result<u64> {
        // Empty files need no blocks; the receiver recreates them from the
        // entry alone.
        if entry.size == 0 {
            progress.start_file(&entry.path);
            progress.finish_file();
            return Ok(0);
        }

        progress.start_file(&entry.path);
        let data = match tokio::fs::read(self.abs(&entry.path)).await {
            Ok(data) if !data.is_empty() => data,
            // The file shrank to nothing after the walk, or is unreadable.
            // Tell the peer to give up on this file so both sides record the
            // same per-file failure and stay in lockstep.
            Ok(_) => {
                self.send_ack(transport, entry, 0, false, Some("source changed"))
                    .await?;
                return Err(SyncError::Access {
                    path: self.abs(&entry.path),
                    source: std::io::Error::other("source changed during transfer"),
                });
            }
            Err(source) => {
                self.send_ack(transport, entry, 0, false, Some("source unreadable"))
                    .await?;
                return Err(SyncError::Access {
                    path: self.abs(&entry.path),
                    source,
                });
            }
        };

        let payloads = delta::plan(&data, signature, self.config.block_size);
        let total = payloads.len() as u32;
        debug!(
            "sending {}: {} blocks, {} literal bytes of {}",
            entry.path,
            total,
            delta::literal_size(&payloads),
            data.len()
        );

        let mut attempts = 0u32;
        let mut acked = self.acked.get(&entry.path).copied().unwrap_or(0);
        let mut next = acked;
        let mut sent_bytes = 0u64;

        loop {
            // Fill the window.
            while next < total && next - acked < self.config.window as u32 {
                let payload = payloads[next as usize].clone();
                let (literal, reused) = match &payload {
                    BlockPayload::Data { bytes, .. } => (bytes.len() as u64, 0),
                    BlockPayload::CopyBaseline { baseline_index } => {
                        (0, baseline_block_len(signature, *baseline_index))
                    }
                };
                let block = BlockData {
                    path: entry.path.clone(),
                    index: next,
                    total,
                    payload,
                    file_hash: entry.hash,
                };
                send_message(transport, &Message::BlockData(block)).await?;
                if literal > 0 {
                    sent_bytes += literal;
                    progress.add_sent(literal);
                } else {
                    progress.add_reused(reused);
                }
                next += 1;
            }

            let ack = match recv_message(transport).await {
                Ok(Message::BlockAck(ack)) => ack,
                Ok(Message::Abort(abort)) => {
                    return Err(SyncError::Protocol(format!(
                        "peer aborted: {}",
                        abort.reason
                    )))
                }
                Ok(other) => {
                    return Err(SyncError::Protocol(format!(
                        "expected BlockAck, got {:?}",
                        other.kind()
                    )))
                }
                Err(e) => {
                    // Remember progress for resume.
                    self.acked.insert(entry.path.clone(), acked);
                    return Err(e);
                }
            };

            if ack.path != entry.path {
                return Err(SyncError::Protocol(format!(
                    "ack for {} while transferring {}",
                    ack.path, entry.path
                )));
            }

            if ack.ok {
                acked = ack.index + 1;
                self.acked.insert(entry.path.clone(), acked);
                if acked == total {
                    self.acked.remove(&entry.path);
                    progress.finish_file();
                    return Ok(sent_bytes);
                }
                continue;
            }

            attempts += 1;
            if attempts >= self.config.max_retries {
                self.acked.remove(&entry.path);
                return Err(SyncError::Integrity {
                    path: entry.path.clone(),
                    expected: entry.hash,
                    actual: entry.hash,
                });
            }

            if ack.index == total - 1 {
                // Whole-file verification failed; start over.
                warn!(
                    "integrity failure on {} (attempt {attempts}): {:?}",
                    entry.path, ack.error
                );
                acked = 0;
                next = 0;
                self.acked.remove(&entry.path);
            } else {
                // Single bad or missing block; rewind to it.
                acked = ack.index;
                next = ack.index;
            }
        }
    }

    /// Receive one file's content and install it at its path. The final
    /// block's ack carries the whole-file verdict; on mismatch the partial
    /// file is discarded and the sender retransmits, bounded by
    /// `max_retries`.
    pub async fn receive_file(
        &mut self,
        transport: &mut dyn Transport,
        entry: &Entry,
    ) -> Result<()> {
        if entry.size == 0 {
            return self.install_file(entry, &[]).await;
        }

        // Existing content at the path serves as the reuse baseline.
        let baseline = tokio::fs::read(self.abs(&entry.path))
            .await
            .unwrap_or_default();

        loop {
            let block = match recv_message(transport).await? {
                Message::BlockData(block) => block,
                // The sender could not read its copy; the file fails on both
                // sides without aborting the session.
                Message::BlockAck(ack) if !ack.ok => {
                    self.partial.remove(&entry.path);
                    return Err(SyncError::Access {
                        path: self.abs(&entry.path),
                        source: std::io::Error::other(
                            ack.error.unwrap_or_else(|| "peer read failure".to_string()),
                        ),
                    });
                }
                Message::Abort(abort) => {
                    return Err(SyncError::Protocol(format!(
                        "peer aborted: {}",
                        abort.reason
                    )))
                }
                other => {
                    return Err(SyncError::Protocol(format!(
                        "expected BlockData, got {:?}",
                        other.kind()
                    )))
                }
            };

            if block.path != entry.path {
                return Err(SyncError::Protocol(format!(
                    "block for {} while receiving {}",
                    block.path, entry.path
                )));
            }
            if block.index >= block.total {
                return Err(SyncError::Protocol(format!(
                    "block index {} out of range 0..{}",
                    block.index, block.total
                )));
            }

            match self.absorb_block(entry, block) {
                BlockOutcome::Continue { ack_index } => {
                    self.send_ack(transport, entry, ack_index, true, None).await?;
                }
                BlockOutcome::Reject { index, reason } => {
                    warn!("rejecting block {index} of {}: {reason}", entry.path);
                    self.send_ack(transport, entry, index, false, Some(reason))
                        .await?;
                }
                BlockOutcome::Complete => {
                    let last = entry_last_index(&self.partial, &entry.path);
                    match self.try_assemble(entry, &baseline).await? {
                        Ok(()) => {
                            self.partial.remove(&entry.path);
                            self.send_ack(transport, entry, last, true, None).await?;
                            info!("received {} ({} bytes)", entry.path, entry.size);
                            return Ok(());
                        }
                        Err(actual) => {
                            let attempts = self.note_failed_attempt(&entry.path);
                            warn!(
                                "whole-file hash mismatch on {} (attempt {attempts}): \
                                 expected {}, got {actual}",
                                entry.path, entry.hash
                            );
                            self.send_ack(transport, entry, last, false, Some("file hash mismatch"))
                                .await?;
                            if attempts >= self.config.max_retries {
                                self.partial.remove(&entry.path);
                                return Err(SyncError::Integrity {
                                    path: entry.path.clone(),
                                    expected: entry.hash,
                                    actual,
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    /// Store one verified block in the partial buffer and classify what to
    /// do next.
    fn absorb_block(&mut self, entry: &Entry, block: BlockData) -> BlockOutcome {
        if let BlockPayload::Data { bytes, hash } = &block.payload {
            if ContentHash::of(bytes) != *hash {
                return BlockOutcome::Reject {
                    index: block.index,
                    reason: "block hash mismatch",
                };
            }
        }

        let state = self
            .partial
            .entry(entry.path.clone())
            .or_insert_with(|| PartialFile::sized(block.total));
        if state.payloads.len() != block.total as usize {
            *state = PartialFile::sized(block.total);
        }

        let is_last = block.index + 1 == block.total;
        state.payloads[block.index as usize] = Some(block.payload);

        if !is_last {
            return BlockOutcome::Continue {
                ack_index: block.index,
            };
        }
        match state.first_missing() {
            // The final block landed but an earlier one never arrived, e.g.
            // after the peer restarted mid-file. Point the sender at the gap.
            Some(missing) => BlockOutcome::Reject {
                index: missing,
                reason: "missing earlier block",
            },
            None => BlockOutcome::Complete,
        }
    }

    /// Assemble the buffered blocks and install on success. The inner result
    /// carries the observed hash on mismatch.
    async fn try_assemble(
        &mut self,
        entry: &Entry,
        baseline: &[u8],
    ) -> Result<std::result::Result<(), ContentHash>> {
        let payloads: Vec<BlockPayload> = match self.partial.get(&entry.path) {
            Some(state) => state.payloads.iter().flatten().cloned().collect(),
            None => Vec::new(),
        };
        let assembled = delta::apply(baseline, self.config.block_size, &payloads)?;
        let actual = ContentHash::of(&assembled);

        if actual == entry.hash {
            self.install_file(entry, &assembled).await?;
            Ok(Ok(()))
        } else {
            Ok(Err(actual))
        }
    }

    fn note_failed_attempt(&mut self, path: &str) -> u32 {
        match self.partial.get_mut(path) {
            Some(state) => {
                state.attempts += 1;
                state.payloads.iter_mut().for_each(|p| *p = None);
                state.attempts
            }
            None => self.config.max_retries,
        }
    }

    async fn send_ack(
        &self,
        transport: &mut dyn Transport,
        entry: &Entry,
        index: u32,
        ok: bool,
        error: Option<&str>,
    ) -> Result<()> {
        send_message(
            transport,
            &Message::BlockAck(BlockAck {
                path: entry.path.clone(),
                index,
                ok,
                error: error.map(str::to_string),
            }),
        )
        .await
    }

    /// Write assembled content to a staging file next to the target, fix up
    /// permissions and rename into place.
    async fn install_file(&self, entry: &Entry, content: &[u8]) -> Result<()> {
        let target = self.abs(&entry.path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let staging = staging_path(&target);
        tokio::fs::write(&staging, content).await?;
        set_mode(&staging, entry.mode).await?;
        tokio::fs::rename(&staging, &target).await?;
        Ok(())
    }
}

/// Bytes the receiver reuses for one baseline block. Plans are computed
/// against the signature's block geometry, which need not match the sender's
/// configured block size.
fn baseline_block_len(signature: Option<&Signature>, index: u32) -> u64 {
    signature.map_or(0, |sig| {
        let start = u64::from(index) * u64::from(sig.block_size);
        sig.file_size
            .saturating_sub(start)
            .min(u64::from(sig.block_size))
    })
}

fn entry_last_index(partial: &HashMap<String, PartialFile>, path: &str) -> u32 {
    partial
        .get(path)
        .map(|s| s.payloads.len().saturating_sub(1) as u32)
        .unwrap_or(0)
}

fn staging_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    target.with_file_name(format!(".{name}.fsync-partial"))
}

#[cfg(unix)]
pub(crate) async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory_pair;
    use chrono::Utc;
    use fsync_shared::EntryKind;

    fn file_entry(path: &str, content: &[u8]) -> Entry {
        Entry {
            path: path.to_string(),
            kind: EntryKind::File,
            size: content.len() as u64,
            modified_at: Utc::now(),
            hash: ContentHash::of(content),
            mode: 0o644,
            symlink_target: None,
        }
    }

    fn small_config() -> TransferConfig {
        TransferConfig {
            block_size: 64,
            window: 4,
            max_retries: 3,
        }
    }

    async fn transfer(
        src_root: &Path,
        dst_root: &Path,
        entry: &Entry,
        signature: Option<Signature>,
    ) -> (Result<u64>, Result<()>) {
        let mut sender = TransferManager::new(src_root, small_config());
        let mut receiver = TransferManager::new(dst_root, small_config());
        let (mut a, mut b) = memory_pair();
        let progress = ProgressTracker::new();

        let entry_s = entry.clone();
        let entry_r = entry.clone();
        let send = async move {
            sender
                .send_file(&mut a, &entry_s, signature.as_ref(), &progress)
                .await
        };
        let recv = async move { receiver.receive_file(&mut b, &entry_r).await };
        tokio::join!(send, recv)
    }

    #[tokio::test]
    async fn test_full_file_transfer() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let content = b"0123456789".repeat(100);
        tokio::fs::write(src.path().join("data.bin"), &content)
            .await
            .unwrap();

        let entry = file_entry("data.bin", &content);
        let (sent, received) = transfer(src.path(), dst.path(), &entry, None).await;
        assert_eq!(sent.unwrap(), content.len() as u64);
        received.unwrap();

        let out = tokio::fs::read(dst.path().join("data.bin")).await.unwrap();
        assert_eq!(out, content);
    }

    #[tokio::test]
    async fn test_delta_transfer_reuses_blocks() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();

        let old = b"A".repeat(64 * 8);
        let mut new = old.clone();
        new[10] = b'B';
        tokio::fs::write(src.path().join("f"), &new).await.unwrap();
        tokio::fs::write(dst.path().join("f"), &old).await.unwrap();

        let sig = delta::signature(&old, 64);
        let entry = file_entry("f", &new);
        let (sent, received) = transfer(src.path(), dst.path(), &entry, Some(sig)).await;

        // Only the edited region travels as literal bytes.
        assert!(sent.unwrap() < 200);
        received.unwrap();
        assert_eq!(tokio::fs::read(dst.path().join("f")).await.unwrap(), new);
    }

    #[tokio::test]
    async fn test_reuse_accounting_follows_signature_geometry() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let content = b"ab".repeat(48); // 96 bytes, three 32-byte blocks
        tokio::fs::write(src.path().join("f"), &content)
            .await
            .unwrap();
        tokio::fs::write(dst.path().join("f"), &content)
            .await
            .unwrap();

        // The receiver signed at 32-byte blocks; the sender's own block size
        // is larger and must not leak into the reuse counter.
        let mut sender = TransferManager::new(
            src.path(),
            TransferConfig {
                block_size: 64,
                window: 4,
                max_retries: 3,
            },
        );
        let mut receiver = TransferManager::new(
            dst.path(),
            TransferConfig {
                block_size: 32,
                window: 4,
                max_retries: 3,
            },
        );
        let sig = delta::signature(&content, 32);
        let entry = file_entry("f", &content);

        let (mut a, mut b) = memory_pair();
        let progress = ProgressTracker::new();
        let entry_r = entry.clone();
        let recv_task = async { receiver.receive_file(&mut b, &entry_r).await };
        let send_task = async {
            sender
                .send_file(&mut a, &entry, Some(&sig), &progress)
                .await
        };
        let (sent, received) = tokio::join!(send_task, recv_task);

        assert_eq!(sent.unwrap(), 0);
        received.unwrap();
        assert_eq!(progress.snapshot().bytes_reused, content.len() as u64);
    }

    #[tokio::test]
    async fn test_empty_file_transfers_no_blocks() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        tokio::fs::write(src.path().join("empty"), b"")
            .await
            .unwrap();

        let entry = file_entry("empty", b"");
        let (sent, received) = transfer(src.path(), dst.path(), &entry, None).await;
        assert_eq!(sent.unwrap(), 0);
        received.unwrap();
        assert_eq!(
            tokio::fs::read(dst.path().join("empty")).await.unwrap(),
            b""
        );
    }

    #[tokio::test]
    async fn test_resume_after_transport_loss() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..64usize * 10).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(src.path().join("big"), &content)
            .await
            .unwrap();
        let entry = file_entry("big", &content);

        let mut sender = TransferManager::new(src.path(), small_config());
        let mut receiver = TransferManager::new(dst.path(), small_config());
        let progress = ProgressTracker::new();

        // First attempt: the receiver acks four blocks, then the pipe drops.
        {
            let (mut a, mut b) = memory_pair();
            let entry_r = entry.clone();
            let recv_side = tokio::spawn(async move {
                for _ in 0..4 {
                    let msg = recv_message(&mut b).await.unwrap();
                    let Message::BlockData(block) = msg else {
                        panic!("expected block")
                    };
                    send_message(
                        &mut b,
                        &Message::BlockAck(BlockAck {
                            path: entry_r.path.clone(),
                            index: block.index,
                            ok: true,
                            error: None,
                        }),
                    )
                    .await
                    .unwrap();
                }
                drop(b);
            });
            let result = sender.send_file(&mut a, &entry, None, &progress).await;
            assert!(matches!(result, Err(SyncError::Transport(_))));
            recv_side.await.unwrap();
        }

        // The real receiver never saw the first attempt; seed its buffer with
        // the blocks that were already acknowledged, as a surviving session
        // would hold them.
        let plan = delta::plan(&content, None, 64);
        let state = receiver
            .partial
            .entry("big".to_string())
            .or_insert_with(|| PartialFile::sized(plan.len() as u32));
        for (i, payload) in plan.iter().take(4).enumerate() {
            state.payloads[i] = Some(payload.clone());
        }

        // Reconnect: only the unacknowledged tail goes over the wire.
        let (mut a, mut b) = memory_pair();
        let entry_r = entry.clone();
        let recv_task = async { receiver.receive_file(&mut b, &entry_r).await };
        let send_task = async { sender.send_file(&mut a, &entry, None, &progress).await };
        let (sent, received) = tokio::join!(send_task, recv_task);

        received.unwrap();
        assert_eq!(sent.unwrap(), (content.len() - 4 * 64) as u64);
        assert_eq!(
            tokio::fs::read(dst.path().join("big")).await.unwrap(),
            content
        );
    }

    #[tokio::test]
    async fn test_missing_block_triggers_rewind() {
        // A receiver with no buffered state nacks the gap when only the tail
        // arrives, and the sender rewinds and retransmits everything.
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..64usize * 6).map(|i| (i % 13) as u8).collect();
        tokio::fs::write(src.path().join("f"), &content)
            .await
            .unwrap();
        let entry = file_entry("f", &content);

        let mut sender = TransferManager::new(src.path(), small_config());
        // Pretend an earlier connection acked the first four blocks.
        sender.acked.insert("f".to_string(), 4);
        let mut receiver = TransferManager::new(dst.path(), small_config());

        let (mut a, mut b) = memory_pair();
        let progress = ProgressTracker::new();
        let entry_r = entry.clone();
        let recv_task = async { receiver.receive_file(&mut b, &entry_r).await };
        let send_task = async { sender.send_file(&mut a, &entry, None, &progress).await };
        let (sent, received) = tokio::join!(send_task, recv_task);

        received.unwrap();
        sent.unwrap();
        assert_eq!(
            tokio::fs::read(dst.path().join("f")).await.unwrap(),
            content
        );
    }

    #[tokio::test]
    async fn test_staging_file_never_left_behind() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let content = b"x".repeat(200);
        tokio::fs::write(src.path().join("f"), &content)
            .await
            .unwrap();

        let entry = file_entry("f", &content);
        let (_, received) = transfer(src.path(), dst.path(), &entry, None).await;
        received.unwrap();

        let mut names = Vec::new();
        let mut dirents = tokio::fs::read_dir(dst.path()).await.unwrap();
        while let Some(d) = dirents.next_entry().await.unwrap() {
            names.push(d.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["f".to_string()]);
    }
}
