use std::sync::{Arc, RwLock};

use anyhow::Result;

use crate::aclcache::RuleCache;
use crate::aclspec::{Rule, RuleSet};
use crate::acltree::AclTree;
use crate::errors::AclError;
use crate::syftpath;

/// Requested access level. ACL documents elevate `Read`/`Write` to the
/// `*Acl` variants so rule files get stricter treatment than plain content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    Read,
    ReadAcl,
    Write,
    WriteAcl,
    Admin,
}

impl AccessLevel {
    fn as_str(self) -> &'static str {
        match self {
            AccessLevel::Read => "read",
            AccessLevel::ReadAcl => "read-acl",
            AccessLevel::Write => "write",
            AccessLevel::WriteAcl => "write-acl",
            AccessLevel::Admin => "admin",
        }
    }
}

/// The file attributes access decisions depend on.
#[derive(Debug, Clone)]
pub struct FileRef {
    pub path: String,
    pub size: i64,
    pub is_dir: bool,
    pub is_symlink: bool,
}

impl FileRef {
    pub fn file(path: impl Into<String>, size: i64) -> Self {
        FileRef {
            path: path.into(),
            size,
            is_dir: false,
            is_symlink: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Admin,
    Write,
    Read,
    None,
}

impl Role {
    // Monotone role order: admin >= write >= read; a write grant implies
    // read. WriteAcl and Admin are admin-only.
    fn covers(self, level: AccessLevel) -> bool {
        match self {
            Role::Admin => true,
            Role::Write => matches!(
                level,
                AccessLevel::Write | AccessLevel::Read | AccessLevel::ReadAcl
            ),
            Role::Read => matches!(level, AccessLevel::Read | AccessLevel::ReadAcl),
            Role::None => false,
        }
    }
}

/// Composes the rule tree and the resolved-rule cache behind one thread-safe
/// surface: many concurrent readers, one writer per mutation.
pub struct AclService {
    tree: RwLock<AclTree>,
    cache: RuleCache,
}

impl Default for AclService {
    fn default() -> Self {
        Self::new()
    }
}

impl AclService {
    pub fn new() -> Self {
        AclService {
            tree: RwLock::new(AclTree::new()),
            cache: RuleCache::new(),
        }
    }

    /// Install or replace a ruleset and invalidate every cached resolution
    /// under its directory.
    pub fn load_rule_set(&self, rs: &RuleSet) -> Result<(), AclError> {
        {
            let mut tree = self.tree.write().expect("acl tree lock");
            tree.add_rule_set(rs)?;
        }
        self.cache.delete_prefix(&rs.path);
        Ok(())
    }

    pub fn remove_rule_set(&self, dir: &str) -> bool {
        let removed = {
            let mut tree = self.tree.write().expect("acl tree lock");
            tree.remove_rule_set(dir)
        };
        if removed {
            self.cache.delete_prefix(dir);
        }
        removed
    }

    pub fn rule_set_count(&self) -> usize {
        self.tree.read().expect("acl tree lock").rule_set_count()
    }

    /// Resolve the governing rule for a (cleaned) path: hot cache first, then
    /// nearest-node + best-rule, filling the cache on the way out.
    pub fn resolve_rule(&self, path: &str) -> Result<Arc<Rule>, AclError> {
        {
            let tree = self.tree.read().expect("acl tree lock");
            if let Some(rule) = self.cache.get(path, |id| tree.node_version(id)) {
                return Ok(rule);
            }
            let node = tree.find_nearest_node_with_rules(path)?;
            let rule = node.find_best_rule(path)?;
            self.cache.set(path, rule.clone(), node.id, node.version);
            Ok(rule)
        }
    }

    /// The `canAccess` contract: owner short-circuit, ACL-file elevation,
    /// limits for plain writes, then the monotone role check. Resolution
    /// errors surface verbatim; the caller decides to deny.
    pub fn check_access(&self, user: &str, file: &FileRef, level: AccessLevel) -> Result<()> {
        let path = syftpath::clean(&file.path)?;
        if syftpath::is_owner(&path, user) {
            return Ok(());
        }

        let level = if syftpath::is_acl_file(&path) {
            match level {
                AccessLevel::Read => AccessLevel::ReadAcl,
                AccessLevel::Write => AccessLevel::WriteAcl,
                other => other,
            }
        } else {
            level
        };

        let rule = self.resolve_rule(&path)?;

        if level == AccessLevel::Write {
            check_limits(&rule, user, &path, file)?;
        }

        let role = if rule.access.admits_admin(user) {
            Role::Admin
        } else if rule.access.admits_write(user) {
            Role::Write
        } else if rule.access.admits_read(user) {
            Role::Read
        } else {
            Role::None
        };

        if role.covers(level) {
            Ok(())
        } else {
            Err(AclError::AccessDenied {
                user: user.to_string(),
                path,
                reason: format!("{} access not granted", level.as_str()),
            }
            .into())
        }
    }

    pub fn can_access(&self, user: &str, file: &FileRef, level: AccessLevel) -> bool {
        self.check_access(user, file, level).is_ok()
    }

    pub fn cached_rules(&self) -> usize {
        self.cache.len()
    }
}

fn check_limits(rule: &Rule, user: &str, path: &str, file: &FileRef) -> Result<()> {
    let limits = &rule.limits;
    let deny = |reason: String| -> Result<()> {
        Err(AclError::AccessDenied {
            user: user.to_string(),
            path: path.to_string(),
            reason,
        }
        .into())
    };
    if file.is_symlink && !limits.allow_symlinks {
        return deny("symlinks not allowed".to_string());
    }
    if file.is_dir && !limits.allow_dirs {
        return deny("directories not allowed".to_string());
    }
    if limits.max_file_size > 0 && file.size > limits.max_file_size {
        return deny(format!(
            "file size {} exceeds limit {}",
            file.size, limits.max_file_size
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aclspec;

    const ALICE: &str = "alice@example.com";
    const BOB: &str = "bob@example.com";

    fn service_with(dir: &str, yaml: &str) -> AclService {
        let svc = AclService::new();
        svc.load_rule_set(&aclspec::parse(yaml, dir).unwrap()).unwrap();
        svc
    }

    fn public_private_split() -> AclService {
        service_with(
            ALICE,
            r#"
terminal: true
rules:
  - pattern: "public/**"
    access: { read: ["*"] }
  - pattern: "**"
    access: {}
"#,
        )
    }

    #[test]
    fn owner_is_always_granted() {
        let svc = AclService::new();
        // No rules loaded at all: the owner still passes every level.
        let file = FileRef::file(format!("{ALICE}/anything/at/all.bin"), 1 << 30);
        for level in [
            AccessLevel::Read,
            AccessLevel::Write,
            AccessLevel::Admin,
            AccessLevel::WriteAcl,
        ] {
            assert!(svc.can_access(ALICE, &file, level));
        }
    }

    #[test]
    fn public_read_private_deny() {
        let svc = public_private_split();
        let public = FileRef::file(format!("{ALICE}/public/a.txt"), 10);
        let private = FileRef::file(format!("{ALICE}/private/a.txt"), 10);

        assert!(svc.can_access(BOB, &public, AccessLevel::Read));
        assert!(!svc.can_access(BOB, &private, AccessLevel::Read));
        assert!(!svc.can_access(BOB, &public, AccessLevel::Write));
    }

    #[test]
    fn acl_file_write_requires_admin() {
        let svc = public_private_split();
        let acl = FileRef::file(format!("{ALICE}/public/syft.pub.yaml"), 128);

        // Read elevates to ReadAcl, which a read grant covers.
        assert!(svc.can_access(BOB, &acl, AccessLevel::Read));
        // Write elevates to WriteAcl, which only admin covers.
        assert!(!svc.can_access(BOB, &acl, AccessLevel::Write));

        let svc = service_with(
            ALICE,
            r#"
rules:
  - pattern: "**"
    access: { admin: ["bob@example.com"] }
"#,
        );
        assert!(svc.can_access(BOB, &acl, AccessLevel::Write));
    }

    #[test]
    fn write_grant_implies_read() {
        let svc = service_with(
            ALICE,
            r#"
rules:
  - pattern: "shared/**"
    access: { write: ["bob@example.com"] }
"#,
        );
        let file = FileRef::file(format!("{ALICE}/shared/doc.md"), 10);
        assert!(svc.can_access(BOB, &file, AccessLevel::Write));
        assert!(svc.can_access(BOB, &file, AccessLevel::Read));
        assert!(!svc.can_access(BOB, &file, AccessLevel::Admin));
    }

    #[test]
    fn limits_gate_plain_writes() {
        let svc = service_with(
            ALICE,
            r#"
rules:
  - pattern: "inbox/**"
    access: { write: ["*"] }
    limits: { maxFileSize: 1024, allowDirs: false, allowSymlinks: false }
"#,
        );

        let small = FileRef::file(format!("{ALICE}/inbox/ok.bin"), 1024);
        assert!(svc.can_access(BOB, &small, AccessLevel::Write));

        let big = FileRef::file(format!("{ALICE}/inbox/big.bin"), 1025);
        assert!(!svc.can_access(BOB, &big, AccessLevel::Write));
        // Oversized content can still be read.
        assert!(svc.can_access(BOB, &big, AccessLevel::Read));

        let dir = FileRef {
            is_dir: true,
            ..FileRef::file(format!("{ALICE}/inbox/sub"), 0)
        };
        assert!(!svc.can_access(BOB, &dir, AccessLevel::Write));

        let link = FileRef {
            is_symlink: true,
            ..FileRef::file(format!("{ALICE}/inbox/link"), 0)
        };
        assert!(!svc.can_access(BOB, &link, AccessLevel::Write));
    }

    #[test]
    fn zero_limits_mean_unlimited() {
        let svc = service_with(
            ALICE,
            r#"
rules:
  - pattern: "**"
    access: { write: ["*"] }
"#,
        );
        let huge = FileRef::file(format!("{ALICE}/data.bin"), i64::MAX);
        assert!(svc.can_access(BOB, &huge, AccessLevel::Write));
    }

    #[test]
    fn missing_rules_surface_no_rule_found() {
        let svc = AclService::new();
        let file = FileRef::file(format!("{ALICE}/a.txt"), 1);
        let err = svc.check_access(BOB, &file, AccessLevel::Read).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AclError>(),
            Some(AclError::NoRuleFound { .. })
        ));
    }

    #[test]
    fn role_matrix_is_monotone() {
        // Exhaust every combination of bob's membership in the three sets and
        // check the grant lattice: admin covers all, write covers read, read
        // never covers write.
        for admin in [false, true] {
            for write in [false, true] {
                for read in [false, true] {
                    let mut access = aclspec::Access::private();
                    if admin {
                        access.admin.insert(BOB.to_string());
                    }
                    if write {
                        access.write.insert(BOB.to_string());
                    }
                    if read {
                        access.read.insert(BOB.to_string());
                    }
                    let rs = RuleSet {
                        path: ALICE.to_string(),
                        terminal: false,
                        rules: vec![crate::aclspec::Rule {
                            pattern: "**".to_string(),
                            access,
                            limits: Default::default(),
                        }],
                    };
                    let svc = AclService::new();
                    svc.load_rule_set(&rs).unwrap();
                    let file = FileRef::file(format!("{ALICE}/f.txt"), 1);

                    let can_read = svc.can_access(BOB, &file, AccessLevel::Read);
                    let can_write = svc.can_access(BOB, &file, AccessLevel::Write);
                    let can_admin = svc.can_access(BOB, &file, AccessLevel::Admin);

                    assert_eq!(can_admin, admin);
                    assert_eq!(can_write, admin || write);
                    assert_eq!(can_read, admin || write || read);
                }
            }
        }
    }

    #[test]
    fn cache_never_serves_stale_rules() {
        let svc = public_private_split();
        let file = FileRef::file(format!("{ALICE}/public/a.txt"), 10);
        assert!(svc.can_access(BOB, &file, AccessLevel::Read));
        assert!(svc.cached_rules() > 0);

        // Flip the ruleset to private; the cached resolution must not
        // survive the version bump.
        let rs = aclspec::parse("rules:\n  - pattern: '**'\n    access: {}\n", ALICE).unwrap();
        svc.load_rule_set(&rs).unwrap();
        assert!(!svc.can_access(BOB, &file, AccessLevel::Read));
    }

    #[test]
    fn removal_falls_back_to_shallower_ruleset() {
        let svc = AclService::new();
        svc.load_rule_set(
            &aclspec::parse("rules:\n  - pattern: '**'\n    access: { read: ['*'] }\n", ALICE)
                .unwrap(),
        )
        .unwrap();
        let sub = format!("{ALICE}/public");
        svc.load_rule_set(&aclspec::parse("rules:\n  - pattern: '**'\n    access: {}\n", &sub).unwrap())
            .unwrap();

        let file = FileRef::file(format!("{ALICE}/public/a.txt"), 1);
        assert!(!svc.can_access(BOB, &file, AccessLevel::Read));

        assert!(svc.remove_rule_set(&sub));
        assert!(svc.can_access(BOB, &file, AccessLevel::Read));
    }
}
