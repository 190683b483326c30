use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::aclspec::Rule;

#[derive(Debug, Clone)]
struct CacheEntry {
    rule: Arc<Rule>,
    node_id: u64,
    node_version: u8,
}

/// Concurrent `path -> resolved rule` cache. Entries snapshot the issuing
/// node's `(id, version)`; a snapshot that no longer matches the tree is
/// discarded on read, so the cache can never serve a rule from a mutated
/// ruleset.
#[derive(Debug, Default)]
pub struct RuleCache {
    map: RwLock<HashMap<String, CacheEntry>>,
}

impl RuleCache {
    pub fn new() -> Self {
        RuleCache::default()
    }

    /// Look up `path`, validating the entry against the node's current
    /// version via `current_version`. Stale entries are evicted and miss.
    pub fn get<F>(&self, path: &str, current_version: F) -> Option<Arc<Rule>>
    where
        F: Fn(u64) -> Option<u8>,
    {
        let entry = {
            let map = self.map.read().expect("rule cache lock");
            map.get(path)?.clone()
        };
        if current_version(entry.node_id) == Some(entry.node_version) {
            return Some(entry.rule);
        }
        self.map
            .write()
            .expect("rule cache lock")
            .remove(path);
        None
    }

    pub fn set(&self, path: &str, rule: Arc<Rule>, node_id: u64, node_version: u8) {
        let mut map = self.map.write().expect("rule cache lock");
        map.insert(
            path.to_string(),
            CacheEntry {
                rule,
                node_id,
                node_version,
            },
        );
    }

    /// Drop every key with the given string prefix. Called whenever a subtree
    /// of rules changes.
    pub fn delete_prefix(&self, prefix: &str) {
        let mut map = self.map.write().expect("rule cache lock");
        map.retain(|key, _| !key.starts_with(prefix));
    }

    pub fn len(&self) -> usize {
        self.map.read().expect("rule cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aclspec::{Access, Limits};

    fn rule(pattern: &str) -> Arc<Rule> {
        Arc::new(Rule {
            pattern: pattern.to_string(),
            access: Access::private(),
            limits: Limits::default(),
        })
    }

    #[test]
    fn hit_while_version_matches() {
        let cache = RuleCache::new();
        cache.set("alice@x/a.txt", rule("**"), 7, 3);

        let got = cache.get("alice@x/a.txt", |id| (id == 7).then_some(3));
        assert!(got.is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn stale_version_evicts_on_read() {
        let cache = RuleCache::new();
        cache.set("alice@x/a.txt", rule("**"), 7, 3);

        assert!(cache.get("alice@x/a.txt", |_| Some(4)).is_none());
        assert!(cache.is_empty());

        // A node the tree no longer knows about also misses.
        cache.set("alice@x/a.txt", rule("**"), 7, 3);
        assert!(cache.get("alice@x/a.txt", |_| None).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn delete_prefix_drops_subtree_only() {
        let cache = RuleCache::new();
        cache.set("alice@x/public/a.txt", rule("**"), 1, 1);
        cache.set("alice@x/public/b.txt", rule("**"), 1, 1);
        cache.set("bob@x/public/a.txt", rule("**"), 2, 1);

        cache.delete_prefix("alice@x/public");
        assert!(cache.get("alice@x/public/a.txt", |_| Some(1)).is_none());
        assert!(cache.get("alice@x/public/b.txt", |_| Some(1)).is_none());
        assert!(cache.get("bob@x/public/a.txt", |_| Some(1)).is_some());
    }
}
