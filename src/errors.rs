use std::fmt;

/// Path normalization failures.
#[derive(Debug, Clone)]
pub struct InvalidPathError {
    pub path: String,
    pub reason: String,
}

impl fmt::Display for InvalidPathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid path {:?}: {}", self.path, self.reason)
    }
}

impl std::error::Error for InvalidPathError {}

impl InvalidPathError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// ACL validation and resolution failures. Carried through `anyhow` and
/// recovered with `downcast_ref` where behavior depends on the kind.
#[derive(Debug, Clone)]
pub enum AclError {
    InvalidPattern { pattern: String, reason: String },
    InvalidAccessSet { pattern: String },
    InvalidLimits { pattern: String, reason: String },
    NoRuleFound { path: String },
    NoMatchingRule { path: String },
    AccessDenied { user: String, path: String, reason: String },
    RuleSetParse { path: String, reason: String },
    RuleSetSave { path: String, reason: String },
}

impl fmt::Display for AclError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AclError::InvalidPattern { pattern, reason } => {
                write!(f, "invalid pattern {pattern:?}: {reason}")
            }
            AclError::InvalidAccessSet { pattern } => {
                write!(f, "rule {pattern:?} has no access set")
            }
            AclError::InvalidLimits { pattern, reason } => {
                write!(f, "rule {pattern:?} has invalid limits: {reason}")
            }
            AclError::NoRuleFound { path } => write!(f, "no ruleset found for {path}"),
            AclError::NoMatchingRule { path } => write!(f, "no rule matches {path}"),
            AclError::AccessDenied { user, path, reason } => {
                write!(f, "access denied for {user} on {path}: {reason}")
            }
            AclError::RuleSetParse { path, reason } => {
                write!(f, "parse ruleset {path}: {reason}")
            }
            AclError::RuleSetSave { path, reason } => {
                write!(f, "save ruleset {path}: {reason}")
            }
        }
    }
}

impl std::error::Error for AclError {}

/// Journal persistence failure.
#[derive(Debug, Clone)]
pub struct JournalStorageError {
    pub reason: String,
}

impl fmt::Display for JournalStorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "journal storage error: {}", self.reason)
    }
}

impl std::error::Error for JournalStorageError {}

/// Engine-level failures. The transient kinds are logged and retried on the
/// next cycle; `SyncAlreadyRunning` is returned to overlapping callers.
#[derive(Debug, Clone)]
pub enum EngineError {
    SyncAlreadyRunning,
    RemoteFetch { reason: String },
    Upload { key: String, reason: String },
    Download { key: String, reason: String },
    Delete { key: String, reason: String },
    ConflictMarked { key: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::SyncAlreadyRunning => write!(f, "sync already running"),
            EngineError::RemoteFetch { reason } => write!(f, "remote fetch failed: {reason}"),
            EngineError::Upload { key, reason } => write!(f, "upload {key} failed: {reason}"),
            EngineError::Download { key, reason } => write!(f, "download {key} failed: {reason}"),
            EngineError::Delete { key, reason } => write!(f, "delete {key} failed: {reason}"),
            EngineError::ConflictMarked { key } => write!(f, "conflict marked for {key}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_round_trip_through_anyhow() {
        let err: anyhow::Error = AclError::NoRuleFound {
            path: "alice@example.com/a.txt".to_string(),
        }
        .into();
        let kind = err.downcast_ref::<AclError>().unwrap();
        assert!(matches!(kind, AclError::NoRuleFound { .. }));
        assert!(err.to_string().contains("no ruleset found"));
    }

    #[test]
    fn sync_already_running_is_matchable() {
        let err: anyhow::Error = EngineError::SyncAlreadyRunning.into();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::SyncAlreadyRunning)
        ));
    }
}
