use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::filters::{SyncFilters, SyncIgnoreList};
use crate::journal::FileMetadata;
use crate::syftpath;

pub const CONFLICTED_SUFFIX: &str = ".conflicted";
pub const REJECTED_SUFFIX: &str = ".rejected";

#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub meta: FileMetadata,
    pub abs_path: PathBuf,
    pub mtime_nanos: u128,
}

/// One pass over the datasites tree: file metadata keyed by datasite-relative
/// path, plus the keys that currently carry a conflict or reject sidecar.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub files: HashMap<String, ScanEntry>,
    pub conflicted: HashSet<String>,
    pub rejected: HashSet<String>,
}

impl ScanResult {
    pub fn metadata(&self) -> HashMap<String, FileMetadata> {
        self.files
            .iter()
            .map(|(k, v)| (k.clone(), v.meta.clone()))
            .collect()
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    size: i64,
    mtime_nanos: u128,
    etag: String,
}

/// Walks the datasites tree and hashes file content, reusing etags for files
/// whose (size, mtime) did not change since the previous scan. Priority
/// uploads and inline remote writes feed the cache through `note_synced` so
/// the next cycle sees them as unchanged without re-hashing.
#[derive(Default)]
pub struct LocalScanner {
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl LocalScanner {
    pub fn scan(&self, datasites_root: &Path, ignore: &SyncIgnoreList) -> Result<ScanResult> {
        let mut result = ScanResult::default();
        let mut next_cache: HashMap<String, CacheEntry> = HashMap::new();

        if !datasites_root.exists() {
            self.cache.lock().expect("scanner cache lock").clear();
            return Ok(result);
        }

        let mut it = WalkDir::new(datasites_root).into_iter();
        while let Some(entry) = it.next() {
            let entry = entry?;
            let ftype = entry.file_type();
            let path = entry.path();
            let rel = path
                .strip_prefix(datasites_root)
                .with_context(|| format!("strip prefix {}", path.display()))?;

            if ftype.is_dir() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if let Some(base) = name.strip_suffix(CONFLICTED_SUFFIX) {
                        if let Some(key) = sidecar_base_key(rel, base) {
                            result.conflicted.insert(key);
                        }
                        it.skip_current_dir();
                        continue;
                    }
                    if let Some(base) = name.strip_suffix(REJECTED_SUFFIX) {
                        if let Some(key) = sidecar_base_key(rel, base) {
                            result.rejected.insert(key);
                        }
                        it.skip_current_dir();
                        continue;
                    }
                }
                if !rel.as_os_str().is_empty() && ignore.should_ignore_rel(rel, true) {
                    it.skip_current_dir();
                }
                continue;
            }
            // Symlinks never sync.
            if ftype.is_symlink() {
                continue;
            }
            if ignore.should_ignore_rel(rel, false) {
                continue;
            }
            let key = rel.to_string_lossy().replace('\\', "/");
            if !syftpath::is_datasite_key(&key) {
                continue;
            }
            if SyncFilters::is_marked_rel_path(&key) {
                continue;
            }

            let meta = entry.metadata()?;
            let size = meta.len() as i64;
            let (mtime_nanos, last_modified) = match meta.modified() {
                Ok(st) => {
                    let d = st.duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
                    (d.as_nanos(), DateTime::<Utc>::from(st))
                }
                Err(_) => (0, Utc::now()),
            };

            let etag = {
                let cache = self.cache.lock().expect("scanner cache lock");
                cache
                    .get(&key)
                    .filter(|prev| prev.size == size && prev.mtime_nanos == mtime_nanos)
                    .map(|prev| prev.etag.clone())
            };
            let etag = match etag {
                Some(etag) => etag,
                None => compute_etag(path)?,
            };

            next_cache.insert(
                key.clone(),
                CacheEntry {
                    size,
                    mtime_nanos,
                    etag: etag.clone(),
                },
            );
            result.files.insert(
                key.clone(),
                ScanEntry {
                    meta: FileMetadata {
                        path: key,
                        size,
                        etag,
                        version: String::new(),
                        last_modified,
                    },
                    abs_path: path.to_path_buf(),
                    mtime_nanos,
                },
            );
        }

        *self.cache.lock().expect("scanner cache lock") = next_cache;
        Ok(result)
    }

    /// Record a freshly synced file so the next scan reuses its etag.
    pub fn note_synced(&self, key: &str, size: i64, mtime_nanos: u128, etag: &str) {
        self.cache.lock().expect("scanner cache lock").insert(
            key.to_string(),
            CacheEntry {
                size,
                mtime_nanos,
                etag: etag.to_string(),
            },
        );
    }
}

fn sidecar_base_key(rel: &Path, base_name: &str) -> Option<String> {
    if base_name.is_empty() {
        return None;
    }
    let parent = rel.parent().unwrap_or_else(|| Path::new(""));
    let key = parent.join(base_name).to_string_lossy().replace('\\', "/");
    Some(key)
}

/// Streaming hex MD5 of a file's content.
pub fn compute_etag(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("open for hashing {}", path.display()))?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

/// Hex MD5 of an in-memory buffer (inline websocket writes).
pub fn content_etag(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Mtime of `path` in nanoseconds since the epoch; zero when unavailable.
pub fn mtime_nanos(path: &Path) -> u128 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}
