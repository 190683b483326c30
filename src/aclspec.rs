use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::errors::AclError;
use crate::syftpath;

/// Wildcard principal: extends a set to every user.
pub const EVERYONE: &str = "*";

/// Pattern of the default rule every loaded ruleset ends with.
pub const DEFAULT_PATTERN: &str = "**";

/// Three monotone sets of principals: admin implies write implies read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    #[serde(default)]
    pub admin: BTreeSet<String>,
    #[serde(default)]
    pub write: BTreeSet<String>,
    #[serde(default)]
    pub read: BTreeSet<String>,
}

impl Access {
    /// Nobody but the datasite owner.
    pub fn private() -> Self {
        Access::default()
    }

    pub fn public_read() -> Self {
        Access {
            read: [EVERYONE.to_string()].into(),
            ..Access::default()
        }
    }

    fn set_admits(set: &BTreeSet<String>, user: &str) -> bool {
        set.contains(EVERYONE) || set.contains(user)
    }

    pub fn admits_admin(&self, user: &str) -> bool {
        Self::set_admits(&self.admin, user)
    }

    pub fn admits_write(&self, user: &str) -> bool {
        Self::set_admits(&self.write, user)
    }

    pub fn admits_read(&self, user: &str) -> bool {
        Self::set_admits(&self.read, user)
    }
}

/// Per-rule resource limits. Zero numeric values mean unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(rename = "maxFileSize", default)]
    pub max_file_size: i64,
    #[serde(rename = "maxFiles", default)]
    pub max_files: u32,
    #[serde(rename = "allowDirs", default = "default_true")]
    pub allow_dirs: bool,
    #[serde(rename = "allowSymlinks", default)]
    pub allow_symlinks: bool,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_file_size: 0,
            max_files: 0,
            allow_dirs: true,
            allow_symlinks: false,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub pattern: String,
    pub access: Access,
    pub limits: Limits,
}

/// One ruleset document (`syft.pub.yaml`), bound to the directory that holds
/// it. `path` is the datasite-relative directory, never the document itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    pub path: String,
    pub terminal: bool,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Default, Deserialize)]
struct RuleSetDoc {
    #[serde(default)]
    terminal: bool,
    #[serde(default)]
    rules: Vec<RuleDoc>,
}

#[derive(Debug, Deserialize)]
struct RuleDoc {
    #[serde(default)]
    pattern: String,
    access: Option<Access>,
    limits: Option<Limits>,
}

#[derive(Serialize)]
struct RuleSetOut<'a> {
    terminal: bool,
    rules: Vec<RuleOut<'a>>,
}

#[derive(Serialize)]
struct RuleOut<'a> {
    pattern: &'a str,
    access: &'a Access,
    limits: &'a Limits,
}

impl RuleSet {
    /// An owner-only ruleset for `dir`.
    pub fn private(dir: &str) -> Self {
        RuleSet {
            path: dir.to_string(),
            terminal: false,
            rules: vec![default_rule()],
        }
    }

    /// A world-readable ruleset for `dir`.
    pub fn public_read(dir: &str) -> Self {
        RuleSet {
            path: dir.to_string(),
            terminal: false,
            rules: vec![Rule {
                pattern: DEFAULT_PATTERN.to_string(),
                access: Access::public_read(),
                limits: Limits::default(),
            }],
        }
    }
}

fn default_rule() -> Rule {
    Rule {
        pattern: DEFAULT_PATTERN.to_string(),
        access: Access::private(),
        limits: Limits::default(),
    }
}

/// Parse and validate a ruleset document. Fail-closed: any invalid rule
/// rejects the whole document. A `**` default rule is injected when absent so
/// every loaded ruleset matches every path.
pub fn parse(content: &str, dir: &str) -> Result<RuleSet, AclError> {
    let doc: RuleSetDoc = serde_yaml::from_str(content).map_err(|e| AclError::RuleSetParse {
        path: dir.to_string(),
        reason: e.to_string(),
    })?;

    let mut rules = Vec::with_capacity(doc.rules.len() + 1);
    for rule in doc.rules {
        syftpath::validate_pattern(&rule.pattern)?;
        let Some(access) = rule.access else {
            return Err(AclError::InvalidAccessSet {
                pattern: rule.pattern,
            });
        };
        let limits = rule.limits.unwrap_or_default();
        if limits.max_file_size < 0 {
            return Err(AclError::InvalidLimits {
                pattern: rule.pattern,
                reason: "negative maxFileSize".to_string(),
            });
        }
        rules.push(Rule {
            pattern: rule.pattern,
            access,
            limits,
        });
    }

    if !rules.iter().any(|r| r.pattern == DEFAULT_PATTERN) {
        rules.push(default_rule());
    }

    Ok(RuleSet {
        path: dir.to_string(),
        terminal: doc.terminal,
        rules,
    })
}

pub fn serialize(rs: &RuleSet) -> Result<String, AclError> {
    let out = RuleSetOut {
        terminal: rs.terminal,
        rules: rs
            .rules
            .iter()
            .map(|r| RuleOut {
                pattern: &r.pattern,
                access: &r.access,
                limits: &r.limits,
            })
            .collect(),
    };
    serde_yaml::to_string(&out).map_err(|e| AclError::RuleSetSave {
        path: rs.path.clone(),
        reason: e.to_string(),
    })
}

/// Load the ruleset document at `file` governing datasite directory `dir`.
pub fn load(file: &Path, dir: &str) -> Result<RuleSet, AclError> {
    let content = fs::read_to_string(file).map_err(|e| AclError::RuleSetParse {
        path: dir.to_string(),
        reason: e.to_string(),
    })?;
    parse(&content, dir)
}

pub fn save(rs: &RuleSet, file: &Path) -> Result<(), AclError> {
    let content = serialize(rs)?;
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|e| AclError::RuleSetSave {
            path: rs.path.clone(),
            reason: e.to_string(),
        })?;
    }
    fs::write(file, content).map_err(|e| AclError::RuleSetSave {
        path: rs.path.clone(),
        reason: e.to_string(),
    })
}

/// True iff a regular (non-symlink) ruleset document exists at `file`.
/// Symlinked ACL documents are never honored.
pub fn exists(file: &Path) -> bool {
    match fs::symlink_metadata(file) {
        Ok(meta) => meta.file_type().is_file(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn make_temp_dir(prefix: &str) -> std::path::PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("{prefix}-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn parse_example_document() {
        let doc = r#"
terminal: true
rules:
  - pattern: "public/**"
    access: { admin: ["alice@example.com"], read: ["*"], write: [] }
    limits: { maxFileSize: 10485760, allowDirs: true, allowSymlinks: false }
  - pattern: "**"
    access: { admin: ["alice@example.com"], read: [], write: [] }
"#;
        let rs = parse(doc, "alice@example.com").unwrap();
        assert!(rs.terminal);
        assert_eq!(rs.rules.len(), 2);
        assert_eq!(rs.rules[0].pattern, "public/**");
        assert_eq!(rs.rules[0].limits.max_file_size, 10_485_760);
        assert!(rs.rules[0].access.admits_read("anyone@example.com"));
        // Second rule had no limits block; defaults are filled in.
        assert_eq!(rs.rules[1].limits, Limits::default());
    }

    #[test]
    fn empty_document_gets_private_default() {
        let rs = parse("", "alice@example.com").unwrap();
        assert!(!rs.terminal);
        assert_eq!(rs.rules.len(), 1);
        assert_eq!(rs.rules[0].pattern, DEFAULT_PATTERN);
        assert_eq!(rs.rules[0].access, Access::private());
    }

    #[test]
    fn missing_catch_all_is_injected() {
        let doc = r#"
rules:
  - pattern: "public/**"
    access: { read: ["*"] }
"#;
        let rs = parse(doc, "alice@example.com").unwrap();
        assert_eq!(rs.rules.len(), 2);
        assert_eq!(rs.rules.last().unwrap().pattern, DEFAULT_PATTERN);
        assert_eq!(rs.rules.last().unwrap().access, Access::private());
    }

    #[test]
    fn invalid_rules_reject_whole_document() {
        let empty_pattern = r#"
rules:
  - pattern: ""
    access: { read: ["*"] }
"#;
        assert!(matches!(
            parse(empty_pattern, "d"),
            Err(AclError::InvalidPattern { .. })
        ));

        let no_access = r#"
rules:
  - pattern: "public/**"
"#;
        assert!(matches!(
            parse(no_access, "d"),
            Err(AclError::InvalidAccessSet { .. })
        ));

        let bad_limits = r#"
rules:
  - pattern: "public/**"
    access: { read: ["*"] }
    limits: { maxFileSize: -1 }
"#;
        assert!(matches!(
            parse(bad_limits, "d"),
            Err(AclError::InvalidLimits { .. })
        ));
    }

    #[test]
    fn serialize_parse_round_trip() {
        let doc = r#"
terminal: true
rules:
  - pattern: "rpc/**"
    access: { admin: ["alice@example.com"], write: ["bob@example.com"], read: ["*"] }
    limits: { maxFileSize: 1024, maxFiles: 10, allowDirs: false, allowSymlinks: false }
"#;
        let rs = parse(doc, "alice@example.com/app_data").unwrap();
        let text = serialize(&rs).unwrap();
        let back = parse(&text, "alice@example.com/app_data").unwrap();
        assert_eq!(rs, back);
    }

    #[test]
    fn exists_rejects_symlinks() {
        let root = make_temp_dir("aclspec-exists-test");
        let real = root.join(crate::syftpath::ACL_FILE_NAME);
        fs::write(&real, "terminal: false\n").unwrap();
        assert!(exists(&real));

        #[cfg(unix)]
        {
            let link = root.join("linked.yaml");
            std::os::unix::fs::symlink(&real, &link).unwrap();
            assert!(!exists(&link));
        }

        assert!(!exists(&root.join("missing.yaml")));
        assert!(!exists(&root));
    }

    #[test]
    fn wildcard_extends_sets() {
        let access = Access {
            write: ["*".to_string()].into(),
            ..Access::default()
        };
        assert!(access.admits_write("anyone@example.com"));
        assert!(!access.admits_admin("anyone@example.com"));
    }
}
