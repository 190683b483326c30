use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Concurrent set of paths with an in-flight sync operation. The engine
/// acquires a guard before touching a path; the next cycle's classifier
/// skips everything still held here, so a single path never has two
/// operations in flight.
#[derive(Debug, Default)]
pub struct SyncStatusMap {
    syncing: Mutex<HashSet<String>>,
}

impl SyncStatusMap {
    pub fn new() -> Self {
        SyncStatusMap::default()
    }

    /// Mark `path` as syncing. Returns `None` when it already is.
    pub fn begin(self: &Arc<Self>, path: &str) -> Option<SyncingGuard> {
        let mut syncing = self.syncing.lock().expect("status map lock");
        if !syncing.insert(path.to_string()) {
            return None;
        }
        Some(SyncingGuard {
            map: self.clone(),
            path: path.to_string(),
        })
    }

    pub fn is_syncing(&self, path: &str) -> bool {
        self.syncing.lock().expect("status map lock").contains(path)
    }

    pub fn count(&self) -> usize {
        self.syncing.lock().expect("status map lock").len()
    }

    pub fn snapshot(&self) -> HashSet<String> {
        self.syncing.lock().expect("status map lock").clone()
    }

    fn finish(&self, path: &str) {
        self.syncing.lock().expect("status map lock").remove(path);
    }
}

/// Releases the path on drop, including every early-return and error path.
#[derive(Debug)]
pub struct SyncingGuard {
    map: Arc<SyncStatusMap>,
    path: String,
}

impl Drop for SyncingGuard {
    fn drop(&mut self) {
        self.map.finish(&self.path);
    }
}
