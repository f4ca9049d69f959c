//! Snapshot diff computation.
//!
//! Compares two path-sorted snapshots with a merge-join and produces an
//! ordered [`ChangeSet`]. A post-pass coalesces Added+Deleted pairs with
//! identical content into Renamed changes so plain moves transfer no bytes.

use std::collections::HashMap;

use tracing::{debug, trace};

use fsync_shared::{Change, ChangeSet, ContentHash, Entry, EntryKind, Snapshot};

/// Compute the change set that transforms `baseline` into `current`.
pub fn diff(baseline: &Snapshot, current: &Snapshot) -> ChangeSet {
    let mut changes = Vec::new();

    let mut base_iter = baseline.entries.values().peekable();
    let mut cur_iter = current.entries.values().peekable();

    // Merge-join over the two path-sorted entry streams.
    loop {
        match (base_iter.peek(), cur_iter.peek()) {
            (Some(old), Some(new)) => match old.path.cmp(&new.path) {
                std::cmp::Ordering::Less => {
                    changes.push(Change::Deleted { old: (*old).clone() });
                    base_iter.next();
                }
                std::cmp::Ordering::Greater => {
                    changes.push(Change::Added { new: (*new).clone() });
                    cur_iter.next();
                }
                std::cmp::Ordering::Equal => {
                    if entry_differs(old, new) {
                        changes.push(Change::Modified {
                            old: (*old).clone(),
                            new: (*new).clone(),
                        });
                    }
                    base_iter.next();
                    cur_iter.next();
                }
            },
            (Some(old), None) => {
                changes.push(Change::Deleted { old: (*old).clone() });
                base_iter.next();
            }
            (None, Some(new)) => {
                changes.push(Change::Added { new: (*new).clone() });
                cur_iter.next();
            }
            (None, None) => break,
        }
    }

    let changes = detect_renames(changes);
    let set = ChangeSet::new(changes);

    debug!(
        "diff {} -> {}: {:?}",
        baseline.seq,
        current.seq,
        set.stats()
    );
    set
}

fn entry_differs(old: &Entry, new: &Entry) -> bool {
    old.kind != new.kind || old.hash != new.hash || old.mode != new.mode
}

/// Coalesce Added+Deleted file pairs with identical content hash and size
/// into a single Renamed change. When several deleted entries match an added
/// one, the shortest path edit distance wins, with a lexicographic tie-break
/// on the deleted path so the result is deterministic.
fn detect_renames(changes: Vec<Change>) -> Vec<Change> {
    // Index deleted files by (hash, size).
    let mut deleted_by_content: HashMap<(ContentHash, u64), Vec<Entry>> = HashMap::new();
    for change in &changes {
        if let Change::Deleted { old } = change {
            if old.kind == EntryKind::File {
                deleted_by_content
                    .entry((old.hash, old.size))
                    .or_default()
                    .push(old.clone());
            }
        }
    }
    if deleted_by_content.is_empty() {
        return changes;
    }

    let mut renames: Vec<(Entry, Entry)> = Vec::new(); // (from, to)
    let mut consumed_added: Vec<String> = Vec::new();

    // Added entries arrive path-sorted from the merge-join, which keeps the
    // candidate assignment deterministic.
    for change in &changes {
        let Change::Added { new } = change else {
            continue;
        };
        if new.kind != EntryKind::File {
            continue;
        }
        let Some(candidates) = deleted_by_content.get_mut(&(new.hash, new.size)) else {
            continue;
        };
        if candidates.is_empty() {
            continue;
        }

        let best = candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, old)| (edit_distance(&old.path, &new.path), old.path.clone()))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let from = candidates.remove(best);

        trace!("rename detected: {} -> {}", from.path, new.path);
        renames.push((from, new.clone()));
        consumed_added.push(new.path.clone());
    }

    if renames.is_empty() {
        return changes;
    }

    let consumed_deleted: Vec<String> = renames.iter().map(|(from, _)| from.path.clone()).collect();

    let mut result: Vec<Change> = changes
        .into_iter()
        .filter(|c| match c {
            Change::Added { new } => !consumed_added.contains(&new.path),
            Change::Deleted { old } => !consumed_deleted.contains(&old.path),
            _ => true,
        })
        .collect();

    for (from, to) in renames {
        result.push(Change::Renamed { from, to });
    }
    result
}

/// Plain Levenshtein distance over path bytes.
fn edit_distance(a: &str, b: &str) -> usize {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}
