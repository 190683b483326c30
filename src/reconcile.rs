use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use crate::filters::SyncIgnoreList;
use crate::journal::FileMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncOp {
    WriteRemote,
    WriteLocal,
    DeleteRemote,
    DeleteLocal,
    Conflict,
    Cleanup,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct SyncOperation {
    pub rel_path: String,
    pub op: SyncOp,
    pub local: Option<FileMetadata>,
    pub remote: Option<FileMetadata>,
    pub last_synced: Option<FileMetadata>,
}

/// Paths excluded from classification this cycle: currently in flight,
/// carrying a conflict sidecar, or on the ignore list. Computed by the engine
/// up front so the classifier itself stays free of I/O.
pub struct SkipSets<'a> {
    pub syncing: &'a HashSet<String>,
    pub conflicted: &'a HashSet<String>,
    pub ignore: Option<&'a SyncIgnoreList>,
}

impl SkipSets<'_> {
    fn should_skip(&self, key: &str) -> bool {
        if self.syncing.contains(key) || self.conflicted.contains(key) {
            return true;
        }
        self.ignore
            .is_some_and(|ig| ig.should_ignore_rel(Path::new(key), false))
    }
}

/// Classified operation batches. The actionable sets are pairwise disjoint
/// and, together with `unchanged` and `ignored`, cover the key union of the
/// three input maps.
#[derive(Debug, Default)]
pub struct Batches {
    pub write_remote: Vec<SyncOperation>,
    pub write_local: Vec<SyncOperation>,
    pub delete_remote: Vec<SyncOperation>,
    pub delete_local: Vec<SyncOperation>,
    pub conflicts: Vec<SyncOperation>,
    pub cleanups: Vec<SyncOperation>,
    pub unchanged: Vec<SyncOperation>,
    pub ignored: Vec<String>,
}

impl Batches {
    pub fn actionable_count(&self) -> usize {
        self.write_remote.len()
            + self.write_local.len()
            + self.delete_remote.len()
            + self.delete_local.len()
            + self.conflicts.len()
            + self.cleanups.len()
    }
}

/// Classify every key observed locally, remotely, or in the journal into one
/// operation. Pure: no I/O, no state mutation; the caller executes.
pub fn reconcile(
    local: &HashMap<String, FileMetadata>,
    remote: &HashMap<String, FileMetadata>,
    journal: &HashMap<String, FileMetadata>,
    skip: &SkipSets<'_>,
) -> Batches {
    // BTreeSet keeps the output order deterministic across runs.
    let mut keys: BTreeSet<&str> = BTreeSet::new();
    keys.extend(local.keys().map(String::as_str));
    keys.extend(remote.keys().map(String::as_str));
    keys.extend(journal.keys().map(String::as_str));

    let mut batches = Batches::default();
    for key in keys {
        if skip.should_skip(key) {
            batches.ignored.push(key.to_string());
            continue;
        }

        let l = local.get(key);
        let r = remote.get(key);
        let j = journal.get(key);
        let op = classify(l, r, j);

        let operation = SyncOperation {
            rel_path: key.to_string(),
            op,
            local: l.cloned(),
            remote: r.cloned(),
            last_synced: j.cloned(),
        };
        match op {
            SyncOp::WriteRemote => batches.write_remote.push(operation),
            SyncOp::WriteLocal => batches.write_local.push(operation),
            SyncOp::DeleteRemote => batches.delete_remote.push(operation),
            SyncOp::DeleteLocal => batches.delete_local.push(operation),
            SyncOp::Conflict => batches.conflicts.push(operation),
            SyncOp::Cleanup => batches.cleanups.push(operation),
            SyncOp::Unchanged => batches.unchanged.push(operation),
        }
    }
    batches
}

fn classify(
    local: Option<&FileMetadata>,
    remote: Option<&FileMetadata>,
    journal: Option<&FileMetadata>,
) -> SyncOp {
    let local_exists = local.is_some();
    let remote_exists = remote.is_some();
    let journal_exists = journal.is_some();

    if !local_exists && !remote_exists && journal_exists {
        return SyncOp::Cleanup;
    }

    // Both sides holding equivalent content is never actionable, whatever the
    // journal says; the engine reseeds the journal row instead.
    if let (Some(l), Some(r)) = (local, remote) {
        if l.is_equivalent(r) {
            return SyncOp::Unchanged;
        }
    }

    let local_modified = matches!((local, journal), (Some(l), Some(j)) if !l.is_equivalent(j));
    let remote_modified = matches!((remote, journal), (Some(r), Some(j)) if !r.is_equivalent(j));

    let local_created = local_exists && !journal_exists;
    let remote_created = remote_exists && !journal_exists;
    let local_deleted = !local_exists && journal_exists && remote_exists;
    let remote_deleted = !remote_exists && journal_exists && local_exists;

    if (local_modified && remote_modified) || (local_created && remote_created) {
        return SyncOp::Conflict;
    }
    if (local_created && !remote_exists) || local_modified {
        return SyncOp::WriteRemote;
    }
    if (remote_created && !local_exists) || remote_modified {
        return SyncOp::WriteLocal;
    }
    if local_deleted {
        return SyncOp::DeleteRemote;
    }
    if remote_deleted {
        return SyncOp::DeleteLocal;
    }
    SyncOp::Unchanged
}
