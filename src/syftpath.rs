use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use globset::{GlobBuilder, GlobMatcher};
use once_cell::sync::Lazy;

use crate::errors::{AclError, InvalidPathError};

/// Canonical file name of a per-directory ruleset document.
pub const ACL_FILE_NAME: &str = "syft.pub.yaml";

// Compiled matchers are cached process-wide; rule patterns repeat heavily
// across rulesets and cycles.
static GLOB_CACHE: Lazy<Mutex<HashMap<String, GlobMatcher>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Normalize a datasite-relative path: forward slashes, no empty segments,
/// no trailing slash. The first segment is the owner identifier.
pub fn clean(raw: &str) -> Result<String, InvalidPathError> {
    let trimmed = raw.trim();
    if trimmed.starts_with('/') {
        return Err(InvalidPathError::new(raw, "absolute path"));
    }
    let mut segments = Vec::new();
    for seg in trimmed.split('/') {
        match seg {
            "" | "." => continue,
            ".." => return Err(InvalidPathError::new(raw, "parent traversal")),
            _ => segments.push(seg),
        }
    }
    let Some(owner) = segments.first() else {
        return Err(InvalidPathError::new(raw, "empty owner segment"));
    };
    if owner.is_empty() {
        return Err(InvalidPathError::new(raw, "empty owner segment"));
    }
    Ok(segments.join("/"))
}

/// True iff the final segment names a ruleset document.
pub fn is_acl_file(path: &str) -> bool {
    path.rsplit('/').next() == Some(ACL_FILE_NAME)
}

/// The ruleset document path for `path`: itself when already one, otherwise
/// the document inside the (cleaned) directory.
pub fn as_acl_path(path: &str) -> Result<String, InvalidPathError> {
    let cleaned = clean(path)?;
    if is_acl_file(&cleaned) {
        return Ok(cleaned);
    }
    Ok(format!("{cleaned}/{ACL_FILE_NAME}"))
}

/// The directory a ruleset document governs; non-ACL paths pass through.
pub fn without_acl_path(path: &str) -> Result<String, InvalidPathError> {
    let cleaned = clean(path)?;
    if !is_acl_file(&cleaned) {
        return Ok(cleaned);
    }
    match cleaned.rsplit_once('/') {
        Some((dir, _)) => Ok(dir.to_string()),
        None => Ok(String::new()),
    }
}

/// First path segment, i.e. the datasite owner.
pub fn owner_of(path: &str) -> Option<&str> {
    let first = path.split('/').next()?;
    if first.is_empty() {
        None
    } else {
        Some(first)
    }
}

/// True iff the cleaned path's first segment equals `user`.
pub fn is_owner(path: &str, user: &str) -> bool {
    if user.is_empty() {
        return false;
    }
    match clean(path) {
        Ok(cleaned) => owner_of(&cleaned) == Some(user),
        Err(_) => false,
    }
}

/// True iff the key sits inside a datasite tree (owner segment is an email
/// shape followed by at least one more segment).
pub fn is_datasite_key(key: &str) -> bool {
    let key = key.trim_start_matches('/');
    let Some((root, _rest)) = key.split_once('/') else {
        return false;
    };
    root.contains('@')
}

fn compile(pattern: &str) -> Result<GlobMatcher, AclError> {
    {
        let cache = GLOB_CACHE.lock().expect("glob cache lock");
        if let Some(m) = cache.get(pattern) {
            return Ok(m.clone());
        }
    }
    let glob = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| AclError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
    let matcher = glob.compile_matcher();
    let mut cache = GLOB_CACHE.lock().expect("glob cache lock");
    cache.insert(pattern.to_string(), matcher.clone());
    Ok(matcher)
}

/// Compile `pattern` without caring about the compiled form; used to validate
/// rule patterns up front.
pub fn validate_pattern(pattern: &str) -> Result<(), AclError> {
    if pattern.is_empty() {
        return Err(AclError::InvalidPattern {
            pattern: String::new(),
            reason: "empty pattern".to_string(),
        });
    }
    compile(pattern).map(|_| ())
}

/// Doublestar glob match: `*` stays within one segment, `**` spans segments,
/// `?` matches one character, `[...]` and `{a,b}` as usual.
pub fn glob_match(pattern: &str, path: &str) -> Result<bool, AclError> {
    Ok(compile(pattern)?.is_match(path))
}

/// Matcher handle for repeated matching of one pattern.
pub fn glob_matcher(pattern: &str) -> Result<GlobMatcher, AclError> {
    compile(pattern)
}

/// Join a ruleset directory and a rule pattern into an absolute pattern.
pub fn join_pattern(dir: &str, pattern: &str) -> String {
    if dir.is_empty() {
        pattern.to_string()
    } else {
        format!("{dir}/{pattern}")
    }
}

/// Specificity score for ordering rules: higher matches first. Catch-alls are
/// pinned to the bottom with fixed scores so ordering stays deterministic.
pub fn specificity(pattern: &str) -> i32 {
    match pattern {
        "**" => return -100,
        "**/*" => return -99,
        _ => {}
    }
    let segment_count = pattern.split('/').count() as i32;
    let mut score = 2 * pattern.len() as i32 + 10 * segment_count;
    for (i, ch) in pattern.char_indices() {
        match ch {
            '*' => score -= if i == 0 { 20 } else { 10 },
            '?' | '!' | '[' | '{' => score -= 2,
            _ => {}
        }
    }
    score
}

/// Stable sort, most specific first.
pub fn sort_by_specificity<T, F>(items: &mut [T], pattern_of: F)
where
    F: Fn(&T) -> &str,
{
    items.sort_by(|a, b| specificity(pattern_of(b)).cmp(&specificity(pattern_of(a))));
}
