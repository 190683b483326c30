use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::errors::JournalStorageError;

/// Last-known metadata for one synced path. `etag` is the hex MD5 of the
/// content for local files and the server-supplied etag for remote objects;
/// `version` is the backend version id and may be empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: String,
    pub size: i64,
    pub etag: String,
    #[serde(default)]
    pub version: String,
    pub last_modified: DateTime<Utc>,
}

impl FileMetadata {
    /// Equivalence ladder: backend version when both sides have one, else
    /// etag when both sides have one, else size plus mtime.
    pub fn is_equivalent(&self, other: &FileMetadata) -> bool {
        if !self.version.is_empty() && !other.version.is_empty() {
            return self.version == other.version;
        }
        if !self.etag.is_empty() && !other.etag.is_empty() {
            return normalize_etag(&self.etag) == normalize_etag(&other.etag);
        }
        self.size == other.size
            && self.last_modified.timestamp() == other.last_modified.timestamp()
    }
}

pub fn normalize_etag(raw: &str) -> String {
    raw.trim().trim_matches('"').to_ascii_lowercase()
}

const JOURNAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_journal (
    path TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    etag TEXT NOT NULL,
    version TEXT NOT NULL DEFAULT '',
    last_modified TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_journal_etag ON sync_journal(etag);
"#;

/// Durable `path -> FileMetadata` table. One writer at a time behind the
/// connection mutex; readers are served from an in-memory snapshot that is
/// kept in lockstep with the table.
pub struct SyncJournal {
    db_path: PathBuf,
    conn: Mutex<Option<rusqlite::Connection>>,
    state: RwLock<HashMap<String, FileMetadata>>,
}

impl SyncJournal {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let conn = rusqlite::Connection::open(db_path)
            .with_context(|| format!("open journal {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("journal WAL mode")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("journal synchronous mode")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("journal busy timeout")?;
        conn.execute_batch(JOURNAL_SCHEMA)
            .context("init journal schema")?;

        let mut state = HashMap::new();
        {
            let mut stmt =
                conn.prepare("SELECT path, size, etag, version, last_modified FROM sync_journal")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let path: String = row.get(0)?;
                let size: i64 = row.get(1)?;
                let etag: String = row.get(2)?;
                let version: String = row.get(3)?;
                let last_modified: String = row.get(4)?;

                let Some(last_modified) = parse_rfc3339(&last_modified) else {
                    crate::logging::warn(format!(
                        "journal row {path} has corrupt timestamp {last_modified:?}, skipping"
                    ));
                    continue;
                };
                state.insert(
                    path.clone(),
                    FileMetadata {
                        path,
                        size,
                        etag,
                        version,
                        last_modified,
                    },
                );
            }
        }

        Ok(SyncJournal {
            db_path: db_path.to_path_buf(),
            conn: Mutex::new(Some(conn)),
            state: RwLock::new(state),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn get(&self, path: &str) -> Option<FileMetadata> {
        self.state
            .read()
            .expect("journal state lock")
            .get(path)
            .cloned()
    }

    /// Insert or replace one row; durable when this returns.
    pub fn set(&self, meta: FileMetadata) -> Result<()> {
        {
            let guard = self.conn.lock().expect("journal conn lock");
            let conn = guard.as_ref().ok_or_else(|| storage_err("journal closed"))?;
            conn.execute(
                "INSERT OR REPLACE INTO sync_journal (path, size, etag, version, last_modified) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    meta.path,
                    meta.size,
                    meta.etag,
                    meta.version,
                    meta.last_modified.to_rfc3339(),
                ],
            )
            .map_err(storage_err)?;
        }
        self.state
            .write()
            .expect("journal state lock")
            .insert(meta.path.clone(), meta);
        Ok(())
    }

    pub fn delete(&self, path: &str) -> Result<()> {
        {
            let guard = self.conn.lock().expect("journal conn lock");
            let conn = guard.as_ref().ok_or_else(|| storage_err("journal closed"))?;
            conn.execute("DELETE FROM sync_journal WHERE path = ?1", params![path])
                .map_err(storage_err)?;
        }
        self.state
            .write()
            .expect("journal state lock")
            .remove(path);
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.state.read().expect("journal state lock").len()
    }

    pub fn paths(&self) -> Vec<String> {
        self.state
            .read()
            .expect("journal state lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Full snapshot, keyed by path.
    pub fn state(&self) -> HashMap<String, FileMetadata> {
        self.state.read().expect("journal state lock").clone()
    }

    /// After a reinstall the table is empty while both sides still hold the
    /// same content. Reseed rows for every path whose local and remote
    /// metadata already agree, so identical files are not re-transferred.
    pub fn rebuild_if_empty(
        &self,
        local: &HashMap<String, FileMetadata>,
        remote: &HashMap<String, FileMetadata>,
    ) -> Result<usize> {
        if self.count() > 0 || local.is_empty() || remote.is_empty() {
            return Ok(0);
        }
        let mut seeded = 0;
        for (key, l) in local {
            let Some(r) = remote.get(key) else { continue };
            if !l.etag.is_empty() && normalize_etag(&l.etag) == normalize_etag(&r.etag) {
                self.set(FileMetadata {
                    path: key.clone(),
                    size: r.size,
                    etag: r.etag.clone(),
                    version: r.version.clone(),
                    last_modified: r.last_modified,
                })?;
                seeded += 1;
            }
        }
        Ok(seeded)
    }

    /// Flush and release the underlying store; later writes fail.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().expect("journal conn lock");
        if let Some(conn) = guard.take() {
            conn.close()
                .map_err(|(_, e)| storage_err(e))
                .context("close journal")?;
        }
        Ok(())
    }
}

fn storage_err(e: impl std::fmt::Display) -> anyhow::Error {
    anyhow::Error::new(JournalStorageError {
        reason: e.to_string(),
    })
}

fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::SystemTime;

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

    fn meta(path: &str, etag: &str) -> FileMetadata {
        FileMetadata {
            path: path.to_string(),
            size: 42,
            etag: etag.to_string(),
            version: String::new(),
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn set_get_round_trip_survives_reopen() {
        let root = make_temp_dir("journal-roundtrip");
        let db = root.join("sync.db");

        let journal = SyncJournal::open(&db).unwrap();
        let m = meta("alice@x/public/a.txt", "a1b2");
        journal.set(m.clone()).unwrap();
        assert_eq!(journal.get(&m.path).unwrap().etag, "a1b2");
        assert_eq!(journal.count(), 1);
        journal.close().unwrap();

        let journal = SyncJournal::open(&db).unwrap();
        let got = journal.get(&m.path).unwrap();
        assert_eq!(got.etag, m.etag);
        assert_eq!(got.size, m.size);
        // RFC3339 keeps sub-second precision through the round trip.
        assert_eq!(got.last_modified.timestamp(), m.last_modified.timestamp());
    }

    #[test]
    fn delete_and_state_snapshot() {
        let root = make_temp_dir("journal-delete");
        let journal = SyncJournal::open(&root.join("sync.db")).unwrap();
        journal.set(meta("alice@x/a", "e1")).unwrap();
        journal.set(meta("alice@x/b", "e2")).unwrap();
        journal.delete("alice@x/a").unwrap();

        let state = journal.state();
        assert_eq!(state.len(), 1);
        assert!(state.contains_key("alice@x/b"));
        assert_eq!(journal.paths(), vec!["alice@x/b".to_string()]);
    }

    #[test]
    fn corrupt_timestamp_rows_are_skipped_not_fatal() {
        let root = make_temp_dir("journal-corrupt");
        let db = root.join("sync.db");
        let journal = SyncJournal::open(&db).unwrap();
        journal.set(meta("alice@x/good", "e1")).unwrap();
        journal.close().unwrap();

        let conn = rusqlite::Connection::open(&db).unwrap();
        conn.execute(
            "INSERT INTO sync_journal (path, size, etag, version, last_modified) \
             VALUES ('alice@x/bad', 1, 'e2', '', 'not-a-timestamp')",
            [],
        )
        .unwrap();
        drop(conn);

        let journal = SyncJournal::open(&db).unwrap();
        assert_eq!(journal.count(), 1);
        assert!(journal.get("alice@x/good").is_some());
        assert!(journal.get("alice@x/bad").is_none());
    }

    #[test]
    fn writes_after_close_fail_with_storage_error() {
        let root = make_temp_dir("journal-closed");
        let journal = SyncJournal::open(&root.join("sync.db")).unwrap();
        journal.close().unwrap();
        let err = journal.set(meta("alice@x/a", "e1")).unwrap_err();
        assert!(err.downcast_ref::<JournalStorageError>().is_some());
    }

    #[test]
    fn rebuild_if_empty_seeds_matching_etags_only() {
        let root = make_temp_dir("journal-rebuild");
        let journal = SyncJournal::open(&root.join("sync.db")).unwrap();

        let mut local = HashMap::new();
        let mut remote = HashMap::new();
        local.insert("alice@x/same".to_string(), meta("alice@x/same", "aa"));
        remote.insert("alice@x/same".to_string(), meta("alice@x/same", "AA"));
        local.insert("alice@x/diff".to_string(), meta("alice@x/diff", "bb"));
        remote.insert("alice@x/diff".to_string(), meta("alice@x/diff", "cc"));
        local.insert("alice@x/only".to_string(), meta("alice@x/only", "dd"));

        let seeded = journal.rebuild_if_empty(&local, &remote).unwrap();
        assert_eq!(seeded, 1);
        assert!(journal.get("alice@x/same").is_some());

        // Non-empty journal is left alone.
        let seeded = journal.rebuild_if_empty(&local, &remote).unwrap();
        assert_eq!(seeded, 0);
    }

    #[test]
    fn equivalence_ladder() {
        let base = meta("p", "etag-a");
        let mut with_version = base.clone();
        with_version.version = "v1".to_string();

        // Version wins when both have one, even over differing etags.
        let mut other = with_version.clone();
        other.etag = "etag-b".to_string();
        assert!(with_version.is_equivalent(&other));
        other.version = "v2".to_string();
        assert!(!with_version.is_equivalent(&other));

        // Etag decides when versions are absent.
        let mut other = base.clone();
        other.etag = "ETAG-A".to_string();
        assert!(base.is_equivalent(&other));
        other.etag = "etag-b".to_string();
        assert!(!base.is_equivalent(&other));

        // Fall back to size + mtime when etags are unusable.
        let mut a = base.clone();
        a.etag = String::new();
        let mut b = a.clone();
        assert!(a.is_equivalent(&b));
        b.size += 1;
        assert!(!a.is_equivalent(&b));
        b = a.clone();
        b.last_modified = a.last_modified + chrono::Duration::seconds(2);
        assert!(!a.is_equivalent(&b));
    }

    #[test]
    fn concurrent_burst_inserts_are_all_visible() {
        let root = make_temp_dir("journal-burst");
        let journal = Arc::new(SyncJournal::open(&root.join("sync.db")).unwrap());

        const WRITERS: usize = 16;
        const TOTAL: usize = 50_000;
        const PER_WRITER: usize = TOTAL / WRITERS;

        let mut handles = Vec::new();
        for w in 0..WRITERS {
            let journal = journal.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_WRITER {
                    let path = format!("alice@x/burst/{w}/{i}.bin");
                    journal
                        .set(FileMetadata {
                            path: path.clone(),
                            size: i as i64,
                            etag: format!("{w:02x}{i:08x}"),
                            version: String::new(),
                            last_modified: Utc::now(),
                        })
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(journal.count(), TOTAL);
        for w in 0..WRITERS {
            assert!(journal.get(&format!("alice@x/burst/{w}/0.bin")).is_some());
            assert!(journal
                .get(&format!("alice@x/burst/{w}/{}.bin", PER_WRITER - 1))
                .is_some());
        }
    }
}
