//! The sync session state machine.
//!
//! One [`Session`] drives a full bidirectional round against a peer:
//!
//! ```text
//! Idle -> Negotiating -> ExchangingChangeSets -> Resolving
//!      -> Transferring -> Committing -> Idle
//! ```
//!
//! Any non-Idle state may fall to Aborted on a protocol, transport or
//! timeout failure; baselines stay untouched because the commit handshake is
//! two-phase. The client initiates every exchange; the server mirrors it.
//! Both sides run the same deterministic resolution, so they derive the same
//! merged snapshot and cross-check its root hash at commit time.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use fsync_shared::{
    Abort, Change, ChangeSet, ChangeSetMsg, ChangeStats, Commit, CommitAck, ConflictDecisionMsg,
    ContentHash, Entry, EntryKind, Hello, Message, Signature, Snapshot, SnapshotBuilder,
    VersionNegotiator, PROTOCOL_VERSION,
};

use crate::conflict::{self, MergePlan, Origin, ResolutionPolicy, ResolvedConflict};
use crate::diff;
use crate::errors::{Result, SyncError};
use crate::progress::ProgressTracker;
use crate::snapshotter::{self, Snapshotter, SnapshotterConfig};
use crate::store::SnapshotStore;
use crate::transfer::{self, delta, TransferConfig, TransferManager};
use crate::transport::{recv_message, send_message, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    ExchangingChangeSets,
    Resolving,
    Transferring,
    Committing,
    Aborted,
}

impl SessionState {
    /// The legal transition table. Aborting is allowed from any active state;
    /// a commit in flight finishes or rolls forward on reconnect instead.
    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Idle, Negotiating)
                | (Negotiating, ExchangingChangeSets)
                | (ExchangingChangeSets, Resolving)
                | (Resolving, Transferring)
                | (Transferring, Committing)
                | (Committing, Idle)
        ) || (to == Aborted && self != Idle && self != Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub root_id: String,
    /// Timeout for each protocol step outside block transfer.
    pub step_timeout: Duration,
    /// Timeout for transferring one file.
    pub transfer_timeout: Duration,
    pub transfer: TransferConfig,
    pub snapshotter: SnapshotterConfig,
}

impl SessionConfig {
    pub fn new(root_id: impl Into<String>) -> Self {
        Self {
            root_id: root_id.into(),
            step_timeout: Duration::from_secs(30),
            transfer_timeout: Duration::from_secs(600),
            transfer: TransferConfig::default(),
            snapshotter: SnapshotterConfig::default(),
        }
    }
}

/// A file the session could not bring over; the rest of the round proceeds.
#[derive(Debug, Clone)]
pub struct FileFailure {
    pub path: String,
    pub reason: String,
}

/// User-visible outcome of one completed sync round.
#[derive(Debug)]
pub struct SyncSummary {
    pub seq: u64,
    pub root_hash: ContentHash,
    /// Changes committed on both sides.
    pub stats: ChangeStats,
    pub conflicts: Vec<ResolvedConflict>,
    pub failed: Vec<FileFailure>,
    /// Unreadable local paths recorded during the walk.
    pub access_errors: Vec<String>,
    /// Literal bytes this side put on the wire.
    pub bytes_sent: u64,
}

pub struct Session {
    role: Role,
    config: SessionConfig,
    state: SessionState,
    root: PathBuf,
    store: Arc<dyn SnapshotStore>,
    policy: Arc<dyn ResolutionPolicy>,
    progress: Arc<ProgressTracker>,
    transfer: TransferManager,
    session_id: String,
    /// Held across the Committing step when set, so concurrent sessions on
    /// the same root cannot interleave their baseline updates.
    commit_lock: Option<Arc<tokio::sync::Mutex<()>>>,
}

impl Session {
    pub fn new(
        role: Role,
        root: impl Into<PathBuf>,
        store: Arc<dyn SnapshotStore>,
        policy: Arc<dyn ResolutionPolicy>,
        config: SessionConfig,
    ) -> Self {
        let root = root.into();
        let transfer = TransferManager::new(&root, config.transfer.clone());
        let session_id = new_session_id(&config.root_id);
        Self {
            role,
            config,
            state: SessionState::Idle,
            root,
            store,
            policy,
            progress: ProgressTracker::new(),
            transfer,
            session_id,
            commit_lock: None,
        }
    }

    pub fn with_commit_lock(mut self, lock: Arc<tokio::sync::Mutex<()>>) -> Self {
        self.commit_lock = Some(lock);
        self
    }

    pub fn client(
        root: impl Into<PathBuf>,
        store: Arc<dyn SnapshotStore>,
        policy: Arc<dyn ResolutionPolicy>,
        config: SessionConfig,
    ) -> Self {
        Self::new(Role::Client, root, store, policy, config)
    }

    pub fn server(
        root: impl Into<PathBuf>,
        store: Arc<dyn SnapshotStore>,
        policy: Arc<dyn ResolutionPolicy>,
        config: SessionConfig,
    ) -> Self {
        Self::new(Role::Server, root, store, policy, config)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn progress(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.progress)
    }

    /// Run one full sync round over the transport. On failure the session is
    /// Aborted and may be run again with a (re)connected transport; block
    /// transfers resume from the first unacknowledged block.
    pub async fn run(&mut self, transport: &mut dyn Transport) -> Result<SyncSummary> {
        self.state = SessionState::Idle;
        match self.run_inner(transport).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                if self.state != SessionState::Aborted {
                    // Best effort; the transport may already be gone.
                    let _ = send_message(
                        transport,
                        &Message::Abort(Abort {
                            reason: e.to_string(),
                        }),
                    )
                    .await;
                    self.state = SessionState::Aborted;
                }
                warn!("session {} aborted: {e}", self.session_id);
                Err(e)
            }
        }
    }

    async fn run_inner(&mut self, transport: &mut dyn Transport) -> Result<SyncSummary> {
        self.transition(SessionState::Negotiating)?;

        let committed = self.load_committed().await?;
        let pending = self.store.load_pending(&self.config.root_id).await?;
        let peer = self.exchange_hello(transport, &committed, pending.as_ref()).await?;

        let (committed, peer_seq, peer_hash) = self
            .roll_forward(transport, committed, pending, &peer)
            .await?;

        let agreed = if committed.seq == peer_seq && peer_hash == Some(committed.root_hash) {
            committed.clone()
        } else {
            info!(
                "baseline mismatch for '{}' (ours seq {}, peer seq {peer_seq}); \
                 falling back to full exchange",
                self.config.root_id, committed.seq
            );
            Snapshot::empty(&self.config.root_id)
        };
        let new_seq = committed.seq.max(peer_seq) + 1;

        self.transition(SessionState::ExchangingChangeSets)?;
        let report = Snapshotter::new(self.config.snapshotter.clone())
            .snapshot(&self.root, &self.config.root_id, new_seq)
            .await?;
        let current = report.snapshot;
        let ours = diff::diff(&agreed, &current);
        debug!(
            "session {}: {} local changes against baseline seq {}",
            self.session_id,
            ours.len(),
            agreed.seq
        );

        let (theirs, mut peer_sigs) = self.exchange_change_sets(transport, &ours).await?;

        self.transition(SessionState::Resolving)?;
        let plan = self
            .resolve_conflicts(transport, &ours, &theirs, &agreed, &mut peer_sigs)
            .await?;

        self.transition(SessionState::Transferring)?;
        let mut failed = Vec::new();
        let transferred = self
            .apply_plan(transport, &plan, &peer_sigs, &mut failed)
            .await?;

        self.transition(SessionState::Committing)?;
        let failed_paths: BTreeSet<String> = failed.iter().map(|f| f.path.clone()).collect();
        let merged = merged_snapshot(&agreed, &plan, &failed_paths, &self.config.root_id, new_seq);
        self.commit(transport, &merged, new_seq).await?;
        self.transition(SessionState::Idle)?;

        let stats = plan_stats(&plan, &failed_paths);
        info!(
            "session {} committed seq {new_seq}: {stats:?}, {} conflicts, {} failed",
            self.session_id,
            plan.conflicts.len(),
            failed.len()
        );

        Ok(SyncSummary {
            seq: new_seq,
            root_hash: merged.root_hash,
            stats,
            conflicts: plan.conflicts,
            failed,
            access_errors: report.access_errors.iter().map(|e| e.to_string()).collect(),
            bytes_sent: transferred,
        })
    }

    fn transition(&mut self, to: SessionState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(SyncError::InvalidTransition {
                from: format!("{:?}", self.state),
                to: format!("{to:?}"),
            });
        }
        debug!("session {}: {:?} -> {to:?}", self.session_id, self.state);
        self.state = to;
        Ok(())
    }

    async fn load_committed(&self) -> Result<Snapshot> {
        Ok(self
            .store
            .load(&self.config.root_id)
            .await?
            .unwrap_or_else(|| Snapshot::empty(&self.config.root_id)))
    }

    /// Receive the next message within the step timeout. A peer Abort turns
    /// into an error with the session already marked Aborted, so no Abort is
    /// echoed back.
    async fn next_message(
        &mut self,
        transport: &mut dyn Transport,
        what: &str,
    ) -> Result<Message> {
        let message = match timeout(self.config.step_timeout, recv_message(transport)).await {
            Ok(result) => result?,
            Err(_) => return Err(SyncError::Timeout(what.to_string())),
        };
        if let Message::Abort(abort) = message {
            self.state = SessionState::Aborted;
            return Err(SyncError::Protocol(format!(
                "peer aborted during {what}: {}",
                abort.reason
            )));
        }
        Ok(message)
    }

    async fn exchange_hello(
        &mut self,
        transport: &mut dyn Transport,
        committed: &Snapshot,
        pending: Option<&Snapshot>,
    ) -> Result<Hello> {
        let hello = Hello {
            version: PROTOCOL_VERSION.to_string(),
            root_id: self.config.root_id.clone(),
            session_id: self.session_id.clone(),
            baseline_seq: Some(committed.seq),
            baseline_root_hash: Some(committed.root_hash),
            pending_seq: pending.map(|p| p.seq),
            pending_root_hash: pending.map(|p| p.root_hash),
        };

        let peer = match self.role {
            Role::Client => {
                send_message(transport, &Message::Hello(hello)).await?;
                let peer = as_hello(self.next_message(transport, "hello").await?)?;
                self.check_peer(&peer)?;
                peer
            }
            Role::Server => {
                let peer = as_hello(self.next_message(transport, "hello").await?)?;
                self.check_peer(&peer)?;
                self.session_id = peer.session_id.clone();
                send_message(transport, &Message::Hello(hello)).await?;
                peer
            }
        };
        Ok(peer)
    }

    fn check_peer(&self, peer: &Hello) -> Result<()> {
        if !VersionNegotiator::is_compatible(&peer.version) {
            return Err(SyncError::Protocol(VersionNegotiator::compatibility_error(
                &peer.version,
            )));
        }
        if peer.root_id != self.config.root_id {
            return Err(SyncError::Protocol(format!(
                "root mismatch: peer syncs '{}', we sync '{}'",
                peer.root_id, self.config.root_id
            )));
        }
        Ok(())
    }

    /// Finish an interrupted commit before the new round starts. Returns the
    /// effective local baseline plus the peer's effective (seq, root hash).
    async fn roll_forward(
        &mut self,
        transport: &mut dyn Transport,
        committed: Snapshot,
        pending: Option<Snapshot>,
        peer: &Hello,
    ) -> Result<(Snapshot, u64, Option<ContentHash>)> {
        let peer_seq = peer.baseline_seq.unwrap_or(0);
        let peer_hash = peer.baseline_root_hash;

        // Our own pending commit: the peer either already holds it, or the
        // commit notification is retried now, before any re-diffing.
        if let Some(p) = pending {
            if peer_seq >= p.seq {
                info!(
                    "peer already committed seq {}; promoting pending snapshot",
                    p.seq
                );
                self.store.save(&self.config.root_id, &p).await?;
                self.store.clear_pending(&self.config.root_id).await?;
                return Ok((p, peer_seq, peer_hash));
            }

            info!("retrying commit notification for pending seq {}", p.seq);
            send_message(
                transport,
                &Message::Commit(Commit {
                    seq: p.seq,
                    root_hash: p.root_hash,
                }),
            )
            .await?;
            let response = match self.next_message(transport, "commit retry ack").await {
                Ok(m) => m,
                Err(e) => {
                    // The peer cannot confirm this commit anymore; drop the
                    // pending snapshot so the next round re-diffs cleanly.
                    let _ = self.store.clear_pending(&self.config.root_id).await;
                    return Err(e);
                }
            };
            match response {
                Message::CommitAck(ack) if ack.seq == p.seq => {
                    self.store.save(&self.config.root_id, &p).await?;
                    self.store.clear_pending(&self.config.root_id).await?;
                    let hash = p.root_hash;
                    let seq = p.seq;
                    return Ok((p, seq, Some(hash)));
                }
                other => {
                    let _ = self.store.clear_pending(&self.config.root_id).await;
                    return Err(SyncError::Protocol(format!(
                        "commit retry rejected: got {:?}",
                        other.kind()
                    )));
                }
            }
        }

        // The peer's pending commit: either our store already reflects it, or
        // the retry arrives as the first post-hello message.
        if let (Some(p_seq), Some(p_hash)) = (peer.pending_seq, peer.pending_root_hash) {
            if committed.seq >= p_seq {
                // The peer promotes by itself once it sees our sequence.
                return Ok((committed, p_seq, Some(p_hash)));
            }

            let message = self.next_message(transport, "commit retry").await?;
            let Message::Commit(commit) = message else {
                return Err(SyncError::Protocol(format!(
                    "expected commit retry, got {:?}",
                    message.kind()
                )));
            };
            if commit.seq != p_seq || commit.root_hash != p_hash {
                return Err(SyncError::Protocol(
                    "commit retry does not match advertised pending snapshot".to_string(),
                ));
            }

            // The transfers of the interrupted round completed before the
            // peer saved its pending snapshot, so our tree should already
            // match. Verify before adopting.
            let report = Snapshotter::new(self.config.snapshotter.clone())
                .snapshot(&self.root, &self.config.root_id, commit.seq)
                .await?;
            if report.snapshot.root_hash != commit.root_hash {
                return Err(SyncError::Protocol(format!(
                    "cannot roll forward commit seq {}: local tree diverged",
                    commit.seq
                )));
            }
            self.store.save(&self.config.root_id, &report.snapshot).await?;
            send_message(transport, &Message::CommitAck(CommitAck { seq: commit.seq })).await?;
            info!("rolled forward peer commit seq {}", commit.seq);
            return Ok((report.snapshot, p_seq, Some(p_hash)));
        }

        Ok((committed, peer_seq, peer_hash))
    }

    async fn exchange_change_sets(
        &mut self,
        transport: &mut dyn Transport,
        ours: &ChangeSet,
    ) -> Result<(ChangeSet, BTreeMap<String, Signature>)> {
        match self.role {
            Role::Client => {
                send_message(
                    transport,
                    &Message::ChangeSetMsg(ChangeSetMsg {
                        changes: ours.clone(),
                        signatures: BTreeMap::new(),
                    }),
                )
                .await?;
                let message = self.next_message(transport, "change set").await?;
                let Message::ChangeSetMsg(msg) = message else {
                    return Err(SyncError::Protocol(format!(
                        "expected change set, got {:?}",
                        message.kind()
                    )));
                };
                // The server has seen our changes and replied with block
                // signatures of its content for the files we will send.
                Ok((msg.changes, msg.signatures))
            }
            Role::Server => {
                let message = self.next_message(transport, "change set").await?;
                let Message::ChangeSetMsg(msg) = message else {
                    return Err(SyncError::Protocol(format!(
                        "expected change set, got {:?}",
                        message.kind()
                    )));
                };
                let signatures = self.local_signatures(msg.changes.iter()).await;
                send_message(
                    transport,
                    &Message::ChangeSetMsg(ChangeSetMsg {
                        changes: ours.clone(),
                        signatures,
                    }),
                )
                .await?;
                // The client's signatures arrive with its conflict decisions.
                Ok((msg.changes, BTreeMap::new()))
            }
        }
    }

    async fn resolve_conflicts(
        &mut self,
        transport: &mut dyn Transport,
        ours: &ChangeSet,
        theirs: &ChangeSet,
        agreed: &Snapshot,
        peer_sigs: &mut BTreeMap<String, Signature>,
    ) -> Result<MergePlan> {
        match self.role {
            Role::Client => {
                let plan = conflict::resolve(ours, theirs, agreed, self.policy.as_ref());
                let decisions = plan
                    .conflicts
                    .iter()
                    .map(|rc| (rc.conflict.path.clone(), rc.decision.clone()))
                    .collect();
                let incoming = plan
                    .changes
                    .iter()
                    .filter(|mc| mc.origin == Origin::Remote)
                    .map(|mc| &mc.change);
                let signatures = self.local_signatures(incoming).await;
                send_message(
                    transport,
                    &Message::ConflictDecision(ConflictDecisionMsg {
                        decisions,
                        signatures,
                    }),
                )
                .await?;
                Ok(plan)
            }
            Role::Server => {
                let message = self.next_message(transport, "conflict decisions").await?;
                let Message::ConflictDecision(msg) = message else {
                    return Err(SyncError::Protocol(format!(
                        "expected conflict decisions, got {:?}",
                        message.kind()
                    )));
                };
                *peer_sigs = msg.signatures;
                conflict::apply_peer_decisions(ours, theirs, agreed, &msg.decisions)
            }
        }
    }

    /// Block signatures of our current content for the paths of incoming
    /// byte-bearing changes, enabling the peer to skip blocks we already
    /// hold.
    async fn local_signatures<'a>(
        &self,
        changes: impl Iterator<Item = &'a Change>,
    ) -> BTreeMap<String, Signature> {
        let mut map = BTreeMap::new();
        for change in changes.filter(|c| c.needs_bytes()) {
            let path = change.path();
            if let Ok(data) = tokio::fs::read(self.root.join(path)).await {
                if !data.is_empty() {
                    map.insert(
                        path.to_string(),
                        delta::signature(&data, self.transfer.block_size()),
                    );
                }
            }
        }
        map
    }

    /// Apply the merge plan to the local tree, moving bytes where needed.
    /// Returns the literal bytes sent. Per-file integrity and access
    /// failures are recorded and the round continues; transport and protocol
    /// failures propagate.
    async fn apply_plan(
        &mut self,
        transport: &mut dyn Transport,
        plan: &MergePlan,
        peer_sigs: &BTreeMap<String, Signature>,
        failed: &mut Vec<FileFailure>,
    ) -> Result<u64> {
        let applicable: Vec<_> = plan
            .changes
            .iter()
            .filter(|mc| {
                mc.change
                    .result()
                    .map_or(true, |e| e.kind != EntryKind::Missing)
            })
            .collect();

        let transfers: Vec<_> = applicable
            .iter()
            .filter(|mc| mc.change.needs_bytes())
            .collect();
        let bytes_expected = transfers
            .iter()
            .filter_map(|mc| mc.change.result())
            .map(|e| e.size)
            .sum();
        self.progress.begin(transfers.len() as u64, bytes_expected);

        // Keep-both resolutions: our losing content moves aside before the
        // winner overwrites the original path.
        for mc in &applicable {
            if mc.origin != Origin::Local {
                continue;
            }
            if let Some(source) = &mc.source_path {
                let from = self.root.join(source);
                let to = self.root.join(mc.change.path());
                if let Err(e) = tokio::fs::copy(&from, &to).await {
                    // The transfer step will surface this as a per-file
                    // failure on both sides.
                    warn!("could not preserve {source} as {}: {e}", mc.change.path());
                }
            }
        }

        // Structural changes: directories, symlinks, renames, mode updates.
        for mc in &applicable {
            if mc.change.needs_bytes() {
                continue;
            }
            if let Err(e) = self.apply_structural(&mc.change).await {
                warn!("structural apply failed for {}: {e}", mc.change.path());
                failed.push(FileFailure {
                    path: mc.change.path().to_string(),
                    reason: e.to_string(),
                });
            }
        }

        // Content transfers, in path order on both sides so the wire stays
        // in lockstep.
        let mut bytes_sent = 0u64;
        for mc in &transfers {
            let Some(entry) = mc.change.result() else {
                continue;
            };
            let progress = Arc::clone(&self.progress);
            let outcome = timeout(self.config.transfer_timeout, async {
                match mc.origin {
                    Origin::Local => {
                        self.transfer
                            .send_file(transport, entry, peer_sigs.get(&entry.path), &progress)
                            .await
                    }
                    Origin::Remote => {
                        progress.start_file(&entry.path);
                        let r = self.transfer.receive_file(transport, entry).await;
                        if r.is_ok() {
                            progress.finish_file();
                        }
                        r.map(|()| 0)
                    }
                }
            })
            .await;

            match outcome {
                Ok(Ok(sent)) => bytes_sent += sent,
                Ok(Err(e @ (SyncError::Integrity { .. } | SyncError::Access { .. }))) => {
                    failed.push(FileFailure {
                        path: entry.path.clone(),
                        reason: e.to_string(),
                    });
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(SyncError::Timeout(format!("transfer of {}", entry.path))),
            }
        }

        // Deletions last, deepest paths first so directories empty out
        // before their own removal.
        let mut deletions: Vec<&Entry> = applicable
            .iter()
            .filter_map(|mc| match &mc.change {
                Change::Deleted { old } => Some(old),
                _ => None,
            })
            .collect();
        deletions.sort_by(|a, b| {
            let depth = |p: &str| p.matches('/').count();
            depth(&b.path).cmp(&depth(&a.path)).then(b.path.cmp(&a.path))
        });
        for entry in deletions {
            if let Err(e) = self.apply_deletion(entry).await {
                warn!("deletion failed for {}: {e}", entry.path);
                failed.push(FileFailure {
                    path: entry.path.clone(),
                    reason: e.to_string(),
                });
            }
        }

        Ok(bytes_sent)
    }

    /// Idempotently bring the local tree in line with a change that moves no
    /// bytes. Applying a change our own tree already reflects is a no-op.
    async fn apply_structural(&self, change: &Change) -> Result<()> {
        match change {
            Change::Added { new } | Change::Modified { new, .. } => {
                let abs = self.root.join(&new.path);
                match new.kind {
                    EntryKind::Directory => {
                        tokio::fs::create_dir_all(&abs).await?;
                        transfer::set_mode(&abs, new.mode).await
                    }
                    EntryKind::File => {
                        // Metadata-only update; content is already in place.
                        transfer::set_mode(&abs, new.mode).await
                    }
                    EntryKind::Symlink => self.install_symlink(new).await,
                    EntryKind::Missing => Ok(()),
                }
            }
            Change::Renamed { from, to } => {
                let from_abs = self.root.join(&from.path);
                let to_abs = self.root.join(&to.path);
                if tokio::fs::symlink_metadata(&to_abs).await.is_ok() {
                    return Ok(()); // already renamed on this side
                }
                if tokio::fs::symlink_metadata(&from_abs).await.is_err() {
                    return Ok(()); // nothing to move; next round repairs
                }
                if let Some(parent) = to_abs.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::rename(&from_abs, &to_abs).await?;
                Ok(())
            }
            Change::Deleted { .. } => Ok(()),
        }
    }

    #[cfg(unix)]
    async fn install_symlink(&self, entry: &Entry) -> Result<()> {
        let Some(target) = &entry.symlink_target else {
            return Err(SyncError::Protocol(format!(
                "symlink entry {} carries no target",
                entry.path
            )));
        };
        let abs = self.root.join(&entry.path);
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::remove_file(&abs).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::symlink(target, &abs).await?;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn install_symlink(&self, entry: &Entry) -> Result<()> {
        warn!("symlink {} skipped on this platform", entry.path);
        Ok(())
    }

    async fn apply_deletion(&self, entry: &Entry) -> Result<()> {
        let abs = self.root.join(&entry.path);
        let result = if entry.kind == EntryKind::Directory {
            tokio::fs::remove_dir_all(&abs).await
        } else {
            tokio::fs::remove_file(&abs).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The two-phase commit. The client persists the merged snapshot as
    /// pending before notifying, so a crash between notification and ack is
    /// finished by roll-forward instead of re-diffing.
    async fn commit(
        &mut self,
        transport: &mut dyn Transport,
        merged: &Snapshot,
        seq: u64,
    ) -> Result<()> {
        let lock = self.commit_lock.clone();
        let _guard = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        match self.role {
            Role::Client => {
                self.store
                    .save_pending(&self.config.root_id, merged)
                    .await?;
                send_message(
                    transport,
                    &Message::Commit(Commit {
                        seq,
                        root_hash: merged.root_hash,
                    }),
                )
                .await?;
                let message = self.next_message(transport, "commit ack").await?;
                match message {
                    Message::CommitAck(ack) if ack.seq == seq => {}
                    other => {
                        return Err(SyncError::Protocol(format!(
                            "expected commit ack for seq {seq}, got {:?}",
                            other.kind()
                        )))
                    }
                }
                self.store.save(&self.config.root_id, merged).await?;
                self.store.clear_pending(&self.config.root_id).await?;
                Ok(())
            }
            Role::Server => {
                let message = self.next_message(transport, "commit").await?;
                let Message::Commit(commit) = message else {
                    return Err(SyncError::Protocol(format!(
                        "expected commit, got {:?}",
                        message.kind()
                    )));
                };
                if commit.seq != seq || commit.root_hash != merged.root_hash {
                    return Err(SyncError::Protocol(format!(
                        "commit mismatch: peer seq {} hash {}, ours seq {seq} hash {}",
                        commit.seq, commit.root_hash, merged.root_hash
                    )));
                }
                self.store.save(&self.config.root_id, merged).await?;
                send_message(transport, &Message::CommitAck(CommitAck { seq })).await?;
                Ok(())
            }
        }
    }
}

fn as_hello(message: Message) -> Result<Hello> {
    match message {
        Message::Hello(hello) => Ok(hello),
        other => Err(SyncError::Protocol(format!(
            "expected hello, got {:?}",
            other.kind()
        ))),
    }
}

fn new_session_id(root_id: &str) -> String {
    static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let digest = ContentHash::of(format!("{root_id}:{nanos}:{n}").as_bytes());
    digest.to_hex()[..16].to_string()
}

/// Build the snapshot both sides commit: the agreed baseline with the plan
/// applied, minus files that failed to transfer. Directory hashes are
/// recomputed the same way the snapshotter does, so the next walk of an
/// unchanged tree diffs empty against it.
fn merged_snapshot(
    agreed: &Snapshot,
    plan: &MergePlan,
    failed: &BTreeSet<String>,
    root_id: &str,
    seq: u64,
) -> Snapshot {
    let mut entries = agreed.entries.clone();

    for mc in &plan.changes {
        if failed.contains(mc.change.path()) {
            continue;
        }
        if let Some(result) = mc.change.result() {
            if result.kind == EntryKind::Missing {
                continue;
            }
        }
        match &mc.change {
            Change::Added { new } | Change::Modified { new, .. } => {
                entries.insert(new.path.clone(), new.clone());
            }
            Change::Deleted { old } => {
                entries.remove(&old.path);
            }
            Change::Renamed { from, to } => {
                entries.remove(&from.path);
                entries.insert(to.path.clone(), to.clone());
            }
        }
    }

    snapshotter::hash_directories(&mut entries);

    let mut builder = SnapshotBuilder::new(root_id, seq);
    for entry in entries.into_values() {
        builder.insert(entry);
    }
    builder.finish()
}

fn plan_stats(plan: &MergePlan, failed: &BTreeSet<String>) -> ChangeStats {
    let mut stats = ChangeStats::default();
    for mc in &plan.changes {
        if failed.contains(mc.change.path()) {
            continue;
        }
        match &mc.change {
            Change::Added { .. } => stats.added += 1,
            Change::Modified { .. } => stats.modified += 1,
            Change::Deleted { .. } => stats.deleted += 1,
            Change::Renamed { .. } => stats.renamed += 1,
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::MergedChange;
    use chrono::Utc;

    #[test]
    fn test_transition_table() {
        use SessionState::*;
        assert!(Idle.can_transition(Negotiating));
        assert!(Negotiating.can_transition(ExchangingChangeSets));
        assert!(ExchangingChangeSets.can_transition(Resolving));
        assert!(Resolving.can_transition(Transferring));
        assert!(Transferring.can_transition(Committing));
        assert!(Committing.can_transition(Idle));

        // Aborting is legal from any active state but not from rest.
        assert!(Negotiating.can_transition(Aborted));
        assert!(Committing.can_transition(Aborted));
        assert!(!Idle.can_transition(Aborted));
        assert!(!Aborted.can_transition(Aborted));

        // No skipping ahead.
        assert!(!Idle.can_transition(Transferring));
        assert!(!Negotiating.can_transition(Committing));
        assert!(!Transferring.can_transition(Idle));
    }

    fn entry(path: &str, content: &[u8]) -> Entry {
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

    fn merged(change: Change) -> MergedChange {
        MergedChange {
            change,
            origin: Origin::Local,
            source_path: None,
        }
    }

    #[test]
    fn test_merged_snapshot_applies_plan() {
        let mut builder = SnapshotBuilder::new("r", 1);
        builder.insert(entry("keep.txt", b"keep"));
        builder.insert(entry("old.txt", b"old"));
        builder.insert(entry("moved.txt", b"m"));
        let baseline = builder.finish();

        let plan = MergePlan {
            changes: vec![
                merged(Change::Added {
                    new: entry("new.txt", b"new"),
                }),
                merged(Change::Deleted {
                    old: entry("old.txt", b"old"),
                }),
                merged(Change::Renamed {
                    from: entry("moved.txt", b"m"),
                    to: entry("dest.txt", b"m"),
                }),
            ],
            conflicts: vec![],
        };

        let snap = merged_snapshot(&baseline, &plan, &BTreeSet::new(), "r", 2);
        assert_eq!(snap.seq, 2);
        assert!(snap.get("keep.txt").is_some());
        assert!(snap.get("new.txt").is_some());
        assert!(snap.get("old.txt").is_none());
        assert!(snap.get("moved.txt").is_none());
        assert!(snap.get("dest.txt").is_some());
        assert!(snap.verify());
    }

    #[test]
    fn test_merged_snapshot_keeps_baseline_for_failed_files() {
        let mut builder = SnapshotBuilder::new("r", 1);
        builder.insert(entry("flaky.txt", b"v1"));
        let baseline = builder.finish();

        let plan = MergePlan {
            changes: vec![merged(Change::Modified {
                old: entry("flaky.txt", b"v1"),
                new: entry("flaky.txt", b"v2"),
            })],
            conflicts: vec![],
        };

        let failed: BTreeSet<String> = ["flaky.txt".to_string()].into();
        let snap = merged_snapshot(&baseline, &plan, &failed, "r", 2);
        assert_eq!(
            snap.get("flaky.txt").unwrap().hash,
            ContentHash::of(b"v1")
        );
    }

    #[test]
    fn test_plan_stats_skip_failed() {
        let plan = MergePlan {
            changes: vec![
                merged(Change::Added {
                    new: entry("a", b"1"),
                }),
                merged(Change::Added {
                    new: entry("b", b"2"),
                }),
            ],
            conflicts: vec![],
        };
        let failed: BTreeSet<String> = ["b".to_string()].into();
        assert_eq!(plan_stats(&plan, &failed).added, 1);
    }

    #[test]
    fn test_session_ids_are_unique_per_session() {
        let a = new_session_id("root");
        let b = new_session_id("root");
        // A process-wide counter feeds the hash; two ids in a row differ.
        assert_ne!(a, b);
        assert_eq!(a.len(), 16);
    }
}
