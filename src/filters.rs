use std::{
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

const DEFAULT_IGNORE_LINES: &[&str] = &[
    // syft
    "syftignore",
    "**/*syftconflict*", // legacy marker
    "**/*syftrejected*", // legacy marker
    "**/*.conflicted/",
    "**/*.rejected/",
    "**/.*.tmp-*", // download temp files
    "**/*.tmp-*",
    // python
    ".ipynb_checkpoints/",
    "__pycache__/",
    "*.py[cod]",
    "dist/",
    "venv/",
    ".venv/",
    // IDE/Editor-specific
    ".vscode",
    ".idea",
    // General excludes
    ".git",
    ".syftbox/",
    "*.tmp",
    "*.log",
    "logs/",
    // OS-specific
    ".DS_Store",
    "Thumbs.db",
    "Icon",
];

const DEFAULT_PRIORITY_LINES: &[&str] = &["**/*.request", "**/*.response"];

#[derive(Clone)]
pub struct SyncIgnoreList {
    base_dir: PathBuf,
    ignore: Gitignore,
}

impl SyncIgnoreList {
    pub fn load(base_dir: &Path) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(base_dir);
        for line in DEFAULT_IGNORE_LINES {
            builder
                .add_line(None, line)
                .with_context(|| format!("add default ignore line: {line}"))?;
        }

        let ignore_path = base_dir.join("syftignore");
        if ignore_path.exists() {
            let custom = read_ignore_file(&ignore_path)?;
            for line in custom {
                builder
                    .add_line(None, &line)
                    .with_context(|| format!("add syftignore line: {line}"))?;
            }
        }

        let ignore = builder.build().context("build ignore matcher")?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            ignore,
        })
    }

    pub fn should_ignore_abs(&self, abs_path: &Path, is_dir: bool) -> bool {
        let rel = abs_path.strip_prefix(&self.base_dir).unwrap_or(abs_path);
        self.should_ignore_rel(rel, is_dir)
    }

    pub fn should_ignore_rel(&self, rel_path: &Path, is_dir: bool) -> bool {
        self.ignore
            .matched_path_or_any_parents(rel_path, is_dir)
            .is_ignore()
    }
}

#[derive(Clone)]
pub struct SyncPriorityList {
    base_dir: PathBuf,
    priority: Gitignore,
}

impl SyncPriorityList {
    pub fn load(base_dir: &Path) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(base_dir);
        for line in DEFAULT_PRIORITY_LINES {
            builder
                .add_line(None, line)
                .with_context(|| format!("add default priority line: {line}"))?;
        }
        let priority = builder.build().context("build priority matcher")?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            priority,
        })
    }

    pub fn should_prioritize_abs(&self, abs_path: &Path, is_dir: bool) -> bool {
        let rel = abs_path.strip_prefix(&self.base_dir).unwrap_or(abs_path);
        self.should_prioritize_rel(rel, is_dir)
    }

    pub fn should_prioritize_rel(&self, rel_path: &Path, is_dir: bool) -> bool {
        self.priority
            .matched_path_or_any_parents(rel_path, is_dir)
            .is_ignore()
    }
}

#[derive(Clone)]
pub struct SyncFilters {
    pub ignore: SyncIgnoreList,
    pub priority: SyncPriorityList,
}

impl SyncFilters {
    pub fn load(datasites_root: &Path) -> Result<Self> {
        fs::create_dir_all(datasites_root)
            .with_context(|| format!("create datasites dir {}", datasites_root.display()))?;
        Ok(Self {
            ignore: SyncIgnoreList::load(datasites_root)?,
            priority: SyncPriorityList::load(datasites_root)?,
        })
    }

    /// True for paths inside (or naming) a conflict/reject sidecar, including
    /// the legacy in-name markers. Keeps marked content out of every scan.
    pub fn is_marked_rel_path(rel: &str) -> bool {
        rel.contains(".conflicted")
            || rel.contains(".rejected")
            || rel.contains("syftrejected")
            || rel.contains("syftconflict")
    }
}

fn read_ignore_file(path: &Path) -> Result<Vec<String>> {
    let file =
        fs::File::open(path).with_context(|| format!("open ignore file {}", path.display()))?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.contains('\0') {
            continue;
        }
        out.push(trimmed.to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, time::SystemTime};

    fn make_temp_dir(prefix: &str) -> PathBuf {
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
    fn default_ignore_keeps_rpc_files() {
        let root = make_temp_dir("syftbox-ignore-test");
        let ignore = SyncIgnoreList::load(&root).unwrap();
        assert!(!ignore.should_ignore_rel(Path::new("alice/app_data/rpc/x.request"), false));
        assert!(!ignore.should_ignore_rel(Path::new("alice/public/data.txt"), false));
        assert!(!ignore.should_ignore_rel(Path::new("alice/public/syft.pub.yaml"), false));
    }

    #[test]
    fn default_ignore_matches_noise() {
        let root = make_temp_dir("syftbox-ignore-noise-test");
        let ignore = SyncIgnoreList::load(&root).unwrap();
        assert!(ignore.should_ignore_rel(Path::new("alice/.DS_Store"), false));
        assert!(ignore.should_ignore_rel(Path::new("alice/app/__pycache__/m.pyc"), false));
        assert!(ignore.should_ignore_rel(Path::new("alice/logs/run.log"), false));
        assert!(ignore.should_ignore_rel(Path::new("alice/public/.a.txt.tmp-8cd89f7b"), false));
    }

    #[test]
    fn sidecar_directories_are_ignored() {
        let root = make_temp_dir("syftbox-ignore-sidecar-test");
        let ignore = SyncIgnoreList::load(&root).unwrap();
        assert!(ignore.should_ignore_rel(Path::new("alice/paper.tex.conflicted/paper.tex"), false));
        assert!(ignore.should_ignore_rel(Path::new("alice/notes.md.rejected/notes.md"), false));
        assert!(ignore.should_ignore_rel(Path::new("alice/legacy-syftconflict-file"), false));
    }

    #[test]
    fn custom_syftignore_extends_defaults() {
        let root = make_temp_dir("syftbox-ignore-custom-test");
        fs::write(root.join("syftignore"), "# comment\n*.scratch\n\n").unwrap();
        let ignore = SyncIgnoreList::load(&root).unwrap();
        assert!(ignore.should_ignore_rel(Path::new("alice/work/x.scratch"), false));
        assert!(!ignore.should_ignore_rel(Path::new("alice/work/x.txt"), false));
    }

    #[test]
    fn default_priority_matches_rpc_traffic() {
        let root = make_temp_dir("syftbox-priority-test");
        let prio = SyncPriorityList::load(&root).unwrap();
        assert!(prio.should_prioritize_rel(Path::new("alice/app_data/rpc/x.request"), false));
        assert!(prio.should_prioritize_rel(Path::new("alice/app_data/rpc/x.response"), false));
        assert!(!prio.should_prioritize_rel(Path::new("alice/public/data.txt"), false));
    }

    #[test]
    fn marked_rel_path_detection() {
        assert!(SyncFilters::is_marked_rel_path(
            "a/paper.tex.conflicted/paper.tex"
        ));
        assert!(SyncFilters::is_marked_rel_path("a/x.rejected/x"));
        assert!(SyncFilters::is_marked_rel_path("a/old-syftconflict"));
        assert!(!SyncFilters::is_marked_rel_path("a/normal.txt"));
    }
}
