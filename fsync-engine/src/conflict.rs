//! Conflict detection and policy-driven resolution.
//!
//! The resolver's job is detection plus mechanical application of an injected
//! [`ResolutionPolicy`]; it never chooses a policy itself. Given the local and
//! remote change sets computed against the shared baseline, it produces a
//! merge plan: a conflict-free list of changes for the final tree, each tagged
//! with the side that holds the bytes.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use fsync_shared::{Change, Conflict, Decision, Entry, Snapshot};

/// Which side of the session holds the content for a merged change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

impl Origin {
    pub fn flipped(self) -> Self {
        match self {
            Origin::Local => Origin::Remote,
            Origin::Remote => Origin::Local,
        }
    }
}

/// One change of the merged outcome, tagged with its content origin.
///
/// `source_path` is set on changes synthesized by keep-both resolutions: the
/// origin side's bytes still live at that path, not at the change's own path.
#[derive(Debug, Clone)]
pub struct MergedChange {
    pub change: Change,
    pub origin: Origin,
    pub source_path: Option<String>,
}

/// A conflict together with the decision the policy produced for it.
#[derive(Debug, Clone)]
pub struct ResolvedConflict {
    pub conflict: Conflict,
    pub decision: Decision,
}

/// Output of a resolution round.
#[derive(Debug, Default)]
pub struct MergePlan {
    /// Path-ordered, conflict-free changes describing the final tree.
    pub changes: Vec<MergedChange>,
    pub conflicts: Vec<ResolvedConflict>,
}

impl MergePlan {
    fn push(&mut self, change: Change, origin: Origin) {
        self.changes.push(MergedChange {
            change,
            origin,
            source_path: None,
        });
    }

    fn push_sourced(&mut self, change: Change, origin: Origin, source_path: String) {
        self.changes.push(MergedChange {
            change,
            origin,
            source_path: Some(source_path),
        });
    }

    fn finish(mut self) -> Self {
        self.changes
            .sort_by(|a, b| a.change.path().cmp(b.change.path()));
        self
    }
}

/// Strategy object deciding the outcome of one conflict.
///
/// Decisions are expressed from the deciding side's perspective: `KeepLocal`
/// keeps that side's change. The session layer maps perspectives when a
/// decision crosses the wire.
pub trait ResolutionPolicy: Send + Sync {
    fn decide(&self, conflict: &Conflict) -> Decision;
    fn name(&self) -> &'static str;
}

/// Latest modification time wins; an exact tie keeps both versions, with the
/// losing side renamed to `<name>.conflict-<timestamp>`.
pub struct LatestWins;

impl ResolutionPolicy for LatestWins {
    fn decide(&self, conflict: &Conflict) -> Decision {
        let local_ts = change_timestamp(&conflict.local);
        let remote_ts = change_timestamp(&conflict.remote);

        match local_ts.cmp(&remote_ts) {
            std::cmp::Ordering::Greater => Decision::KeepLocal,
            std::cmp::Ordering::Less => Decision::KeepRemote,
            std::cmp::Ordering::Equal => {
                // Tie: both survive when the losing side still has content;
                // delete-vs-delete degenerates to a plain skip.
                match loser_entry(&conflict.remote) {
                    Some(_) => Decision::KeepBothRenamed {
                        renamed_path: conflict_rename(&conflict.path, remote_ts),
                    },
                    None => Decision::KeepLocal,
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "latest-wins"
    }
}

/// Always keep the deciding side's change.
pub struct OursWins;

impl ResolutionPolicy for OursWins {
    fn decide(&self, _conflict: &Conflict) -> Decision {
        Decision::KeepLocal
    }

    fn name(&self) -> &'static str {
        "ours-wins"
    }
}

/// Always keep the peer's change.
pub struct TheirsWins;

impl ResolutionPolicy for TheirsWins {
    fn decide(&self, _conflict: &Conflict) -> Decision {
        Decision::KeepRemote
    }

    fn name(&self) -> &'static str {
        "theirs-wins"
    }
}

/// Defer every conflict to a caller-supplied callback.
pub struct ManualPolicy {
    callback: Box<dyn Fn(&Conflict) -> Decision + Send + Sync>,
}

impl ManualPolicy {
    pub fn new(callback: impl Fn(&Conflict) -> Decision + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl ResolutionPolicy for ManualPolicy {
    fn decide(&self, conflict: &Conflict) -> Decision {
        (self.callback)(conflict)
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}

/// Every path a change set touches: destinations, plus the source paths that
/// renames vacate.
fn touched_paths(set: &fsync_shared::ChangeSet) -> BTreeSet<&str> {
    let mut paths = BTreeSet::new();
    for change in set {
        paths.insert(change.path());
        if let Change::Renamed { from, .. } = change {
            paths.insert(from.path.as_str());
        }
    }
    paths
}

/// A rename whose source path the other side also changed cannot merge as a
/// unit: the vacated path carries a real divergence that per-destination
/// indexing would miss. Split such renames into their delete-plus-add parts
/// so the plain per-path walk sees the overlap. Both sides hold both change
/// sets, so they split the same renames and stay in lockstep.
fn split_contested_renames(
    set: &fsync_shared::ChangeSet,
    other: &fsync_shared::ChangeSet,
) -> Vec<Change> {
    let other_paths = touched_paths(other);
    let mut changes = Vec::with_capacity(set.len());
    for change in set {
        match change {
            Change::Renamed { from, to } if other_paths.contains(from.path.as_str()) => {
                trace!(
                    "splitting rename {} -> {}: source contested by peer",
                    from.path,
                    to.path
                );
                changes.push(Change::Deleted { old: from.clone() });
                changes.push(Change::Added { new: to.clone() });
            }
            change => changes.push(change.clone()),
        }
    }
    changes
}

/// Detect conflicts between the two change sets and apply `policy` to each,
/// producing the merged plan.
pub fn resolve(
    local: &fsync_shared::ChangeSet,
    remote: &fsync_shared::ChangeSet,
    baseline: &Snapshot,
    policy: &dyn ResolutionPolicy,
) -> MergePlan {
    let local_changes = split_contested_renames(local, remote);
    let remote_changes = split_contested_renames(remote, local);
    let local_by_path: BTreeMap<&str, &Change> =
        local_changes.iter().map(|c| (c.path(), c)).collect();
    let remote_by_path: BTreeMap<&str, &Change> =
        remote_changes.iter().map(|c| (c.path(), c)).collect();

    let mut plan = MergePlan::default();

    for (path, local_change) in &local_by_path {
        match remote_by_path.get(path) {
            None => plan.push((*local_change).clone(), Origin::Local),
            Some(remote_change) => {
                if is_noop_equivalent(local_change, remote_change) {
                    // Both sides arrived at the same result independently.
                    trace!("equivalent changes at {path}, no conflict");
                    plan.push((*local_change).clone(), Origin::Local);
                    continue;
                }

                let conflict = Conflict {
                    path: (*path).to_string(),
                    local: (*local_change).clone(),
                    remote: (*remote_change).clone(),
                    baseline: baseline.get(path).cloned(),
                };
                let decision = policy.decide(&conflict);
                apply_decision(&mut plan, &conflict, &decision, Origin::Local);
                plan.conflicts.push(ResolvedConflict { conflict, decision });
            }
        }
    }

    for (path, remote_change) in &remote_by_path {
        if !local_by_path.contains_key(path) {
            plan.push((*remote_change).clone(), Origin::Remote);
        }
    }

    debug!(
        "resolution with '{}': {} merged changes, {} conflicts",
        policy.name(),
        plan.changes.len(),
        plan.conflicts.len()
    );
    plan.finish()
}

/// Rebuild the merge plan from the peer's recorded decisions. The decisions
/// arrived in the peer's perspective, so local/remote are flipped here.
pub fn apply_peer_decisions(
    local: &fsync_shared::ChangeSet,
    remote: &fsync_shared::ChangeSet,
    baseline: &Snapshot,
    peer_decisions: &[(String, Decision)],
) -> crate::errors::Result<MergePlan> {
    let decisions: BTreeMap<&str, &Decision> = peer_decisions
        .iter()
        .map(|(p, d)| (p.as_str(), d))
        .collect();

    let local_changes = split_contested_renames(local, remote);
    let remote_changes = split_contested_renames(remote, local);
    let local_by_path: BTreeMap<&str, &Change> =
        local_changes.iter().map(|c| (c.path(), c)).collect();
    let remote_by_path: BTreeMap<&str, &Change> =
        remote_changes.iter().map(|c| (c.path(), c)).collect();

    let mut plan = MergePlan::default();

    for (path, local_change) in &local_by_path {
        match remote_by_path.get(path) {
            None => plan.push((*local_change).clone(), Origin::Local),
            Some(remote_change) => {
                if is_noop_equivalent(local_change, remote_change) {
                    plan.push((*local_change).clone(), Origin::Local);
                    continue;
                }
                let decision = decisions.get(path).copied().ok_or_else(|| {
                    crate::errors::SyncError::Protocol(format!(
                        "peer sent no decision for conflicting path {path}"
                    ))
                })?;
                // The conflict is rebuilt in the decider's perspective: the
                // peer's own change is its "local".
                let conflict = Conflict {
                    path: (*path).to_string(),
                    local: (*remote_change).clone(),
                    remote: (*local_change).clone(),
                    baseline: baseline.get(path).cloned(),
                };
                apply_decision(&mut plan, &conflict, decision, Origin::Remote);
                plan.conflicts.push(ResolvedConflict {
                    conflict,
                    decision: decision.clone(),
                });
            }
        }
    }

    for (path, remote_change) in &remote_by_path {
        if !local_by_path.contains_key(path) {
            plan.push((*remote_change).clone(), Origin::Remote);
        }
    }

    Ok(plan.finish())
}

/// Mechanically apply one decision. The conflict is always expressed in the
/// deciding side's perspective, so `conflict.local` is the winner of
/// `KeepLocal`; `decider_origin` says which side of this session the decider
/// is, so origins come out right on both sides of the wire.
fn apply_decision(
    plan: &mut MergePlan,
    conflict: &Conflict,
    decision: &Decision,
    decider_origin: Origin,
) {
    match decision {
        Decision::KeepLocal => plan.push(conflict.local.clone(), decider_origin),
        Decision::KeepRemote => plan.push(conflict.remote.clone(), decider_origin.flipped()),
        Decision::KeepBothRenamed { renamed_path } => {
            plan.push(conflict.local.clone(), decider_origin);
            if let Some(loser) = loser_entry(&conflict.remote) {
                let mut renamed = loser.clone();
                renamed.path = renamed_path.clone();
                plan.push_sourced(
                    Change::Added { new: renamed },
                    decider_origin.flipped(),
                    conflict.path.clone(),
                );
            }
        }
        Decision::Skip => {}
    }
}

/// Two changes are no-op-equivalent when both sides produced an identical
/// resulting entry (or both removed the path).
fn is_noop_equivalent(a: &Change, b: &Change) -> bool {
    match (a.result(), b.result()) {
        (None, None) => true,
        (Some(ra), Some(rb)) => ra.hash == rb.hash && ra.kind == rb.kind && ra.mode == rb.mode,
        _ => false,
    }
}

fn change_timestamp(change: &Change) -> chrono::DateTime<chrono::Utc> {
    match change.result() {
        Some(entry) => entry.modified_at,
        // A deletion carries no resulting entry; fall back to the removed
        // entry's last known mtime.
        None => match change {
            Change::Deleted { old } => old.modified_at,
            _ => chrono::Utc::now(),
        },
    }
}

fn loser_entry(change: &Change) -> Option<&Entry> {
    change.result().filter(|e| e.is_file())
}

fn conflict_rename(path: &str, ts: chrono::DateTime<chrono::Utc>) -> String {
    format!("{path}.conflict-{}", ts.timestamp())
}
