use std::collections::HashMap;
use std::sync::Arc;

use globset::GlobMatcher;

use crate::aclspec::{Rule, RuleSet};
use crate::errors::AclError;
use crate::syftpath;

/// A rule with its matcher compiled against the owning node's directory.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: Arc<Rule>,
    matcher: GlobMatcher,
}

impl CompiledRule {
    pub fn matches(&self, path: &str) -> bool {
        self.matcher.is_match(path)
    }
}

/// One node per directory that holds (or held) a ruleset. Nodes are owned
/// exclusively by the tree; rules are shared immutably via `Arc`.
#[derive(Debug)]
pub struct AclNode {
    pub path: String,
    pub depth: u8,
    pub terminal: bool,
    /// Wrapping cache-invalidation token; bumped on every mutation.
    pub version: u8,
    pub id: u64,
    rules: Vec<CompiledRule>,
    children: HashMap<String, AclNode>,
}

impl AclNode {
    fn new(id: u64, path: String, depth: u8) -> Self {
        AclNode {
            path,
            depth,
            terminal: false,
            version: 0,
            id,
            rules: Vec::new(),
            children: HashMap::new(),
        }
    }

    pub fn has_rules(&self) -> bool {
        !self.rules.is_empty()
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// First match wins; rules are pre-sorted most-specific-first. Rulesets
    /// loaded through `aclspec::parse` always end with a `**` rule, so this
    /// only fails for hand-assembled rule lists.
    pub fn find_best_rule(&self, path: &str) -> Result<Arc<Rule>, AclError> {
        for compiled in &self.rules {
            if compiled.matches(path) {
                return Ok(compiled.rule.clone());
            }
        }
        Err(AclError::NoMatchingRule {
            path: path.to_string(),
        })
    }
}

/// Forest of rule nodes rooted at the implicit empty path, keyed by directory
/// depth. Mutations go through `add_rule_set` / `remove_rule_set` only.
#[derive(Debug)]
pub struct AclTree {
    root: AclNode,
    // node id -> current version, so cache entries can be validated without
    // holding a pointer into the tree.
    versions: HashMap<u64, u8>,
    next_id: u64,
}

impl Default for AclTree {
    fn default() -> Self {
        Self::new()
    }
}

impl AclTree {
    pub fn new() -> Self {
        AclTree {
            root: AclNode::new(0, String::new(), 0),
            versions: HashMap::from([(0, 0)]),
            next_id: 1,
        }
    }

    /// Install (or replace) the ruleset for `rs.path`. Intermediate nodes are
    /// created as needed; an existing node is reused so child pointers
    /// survive, and its version is bumped.
    pub fn add_rule_set(&mut self, rs: &RuleSet) -> Result<(), AclError> {
        let compiled = compile_rules(rs)?;

        let Self {
            root,
            versions,
            next_id,
        } = self;

        let mut node = root;
        if !rs.path.is_empty() {
            for seg in rs.path.split('/') {
                let parent_path = node.path.clone();
                let parent_depth = node.depth;
                node = node.children.entry(seg.to_string()).or_insert_with(|| {
                    let id = *next_id;
                    *next_id += 1;
                    versions.insert(id, 0);
                    let path = syftpath::join_pattern(&parent_path, seg);
                    AclNode::new(id, path, parent_depth.saturating_add(1))
                });
            }
        }

        node.rules = compiled;
        node.terminal = rs.terminal;
        node.version = node.version.wrapping_add(1);
        versions.insert(node.id, node.version);
        Ok(())
    }

    /// Clear the ruleset (and terminal flag) at `dir`. The node itself stays
    /// in place when it has children. Returns whether anything was removed.
    pub fn remove_rule_set(&mut self, dir: &str) -> bool {
        let Self {
            root, versions, ..
        } = self;
        let Some(node) = find_node_mut(root, dir) else {
            return false;
        };
        if node.rules.is_empty() {
            return false;
        }
        node.rules.clear();
        node.terminal = false;
        node.version = node.version.wrapping_add(1);
        versions.insert(node.id, node.version);
        true
    }

    /// Walk from the root along `path`, tracking the deepest node with a
    /// non-empty ruleset. A terminal node discards anything tracked above it,
    /// and (when it has rules) hides everything below it.
    pub fn find_nearest_node_with_rules(&self, path: &str) -> Result<&AclNode, AclError> {
        let mut best: Option<&AclNode> = None;
        let mut cur = &self.root;
        let mut segments = path.split('/');
        loop {
            if cur.terminal {
                best = None;
            }
            if cur.has_rules() {
                best = Some(cur);
                if cur.terminal {
                    break;
                }
            }
            let Some(seg) = segments.next() else { break };
            match cur.children.get(seg) {
                Some(child) => cur = child,
                None => break,
            }
        }
        best.ok_or_else(|| AclError::NoRuleFound {
            path: path.to_string(),
        })
    }

    /// Current version token for a node id; `None` once a node is unknown.
    pub fn node_version(&self, id: u64) -> Option<u8> {
        self.versions.get(&id).copied()
    }

    pub fn rule_set_count(&self) -> usize {
        fn walk(node: &AclNode) -> usize {
            let own = usize::from(node.has_rules());
            own + node.children.values().map(walk).sum::<usize>()
        }
        walk(&self.root)
    }
}

fn find_node_mut<'a>(root: &'a mut AclNode, dir: &str) -> Option<&'a mut AclNode> {
    let mut node = root;
    if dir.is_empty() {
        return Some(node);
    }
    for seg in dir.split('/') {
        node = node.children.get_mut(seg)?;
    }
    Some(node)
}

fn compile_rules(rs: &RuleSet) -> Result<Vec<CompiledRule>, AclError> {
    let mut compiled = Vec::with_capacity(rs.rules.len());
    for rule in &rs.rules {
        let joined = syftpath::join_pattern(&rs.path, &rule.pattern);
        let matcher = syftpath::glob_matcher(&joined)?;
        compiled.push(CompiledRule {
            rule: Arc::new(rule.clone()),
            matcher,
        });
    }
    // Most specific first; the dir prefix is common to all patterns so the
    // raw pattern decides the order.
    compiled.sort_by(|a, b| {
        syftpath::specificity(&b.rule.pattern).cmp(&syftpath::specificity(&a.rule.pattern))
    });
    Ok(compiled)
}
