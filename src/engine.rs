use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use reqwest::StatusCode;
use tokio::sync::{mpsc, Notify};
use walkdir::WalkDir;

use crate::acl::{AccessLevel, AclService, FileRef};
use crate::aclspec;
use crate::errors::EngineError;
use crate::filters::SyncFilters;
use crate::http::{self, ApiClient, HttpStatusError, PresignedParams};
use crate::journal::{normalize_etag, FileMetadata, SyncJournal};
use crate::reconcile::{self, SkipSets, SyncOperation};
use crate::scanner::{self, LocalScanner, ScanResult, CONFLICTED_SUFFIX, REJECTED_SUFFIX};
use crate::status::SyncStatusMap;
use crate::syftpath;
use crate::watcher::{self, WatchEvent, WatchKind};
use crate::wsproto::{self, Decoded, FileWriteMsg, INLINE_WRITE_MAX_BYTES};

const UPLOAD_WORKERS: usize = 4;
const DOWNLOAD_WORKERS: usize = 4;
const ACL_BOOTSTRAP_WORKERS: usize = 8;

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub owner_email: String,
    pub sync_interval: Duration,
}

impl EngineConfig {
    pub fn new(data_dir: &Path, owner_email: &str) -> Self {
        EngineConfig {
            data_dir: data_dir.to_path_buf(),
            owner_email: owner_email.to_string(),
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }

    pub fn datasites_root(&self) -> PathBuf {
        self.data_dir.join("datasites")
    }

    pub fn internal_dir(&self) -> PathBuf {
        self.data_dir.join(".syftbox")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.internal_dir().join("sync.db")
    }

    fn downloads_tmp_dir(&self) -> PathBuf {
        self.internal_dir().join("downloads")
    }
}

/// Planned per-op counts of one cycle, for logging and tests.
#[derive(Debug, Default, Clone)]
pub struct CycleStats {
    pub uploads: usize,
    pub downloads: usize,
    pub remote_deletes: usize,
    pub local_deletes: usize,
    pub conflicts: usize,
    pub cleanups: usize,
    pub unchanged: usize,
    pub ignored: usize,
}

/// The sync engine: periodic full-sync cycles plus the low-latency paths fed
/// by the file watcher and the websocket event channel. All collaborators
/// are injected; the engine owns no global state.
pub struct SyncEngine {
    cfg: EngineConfig,
    api: Arc<ApiClient>,
    journal: Arc<SyncJournal>,
    acl: Arc<AclService>,
    filters: Arc<SyncFilters>,
    scanner: Arc<LocalScanner>,
    status: Arc<SyncStatusMap>,
    cycle_lock: tokio::sync::Mutex<()>,
    sync_trigger: Notify,
    ws_out: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl SyncEngine {
    pub fn new(
        cfg: EngineConfig,
        api: Arc<ApiClient>,
        journal: Arc<SyncJournal>,
        acl: Arc<AclService>,
        filters: Arc<SyncFilters>,
    ) -> Arc<Self> {
        Arc::new(SyncEngine {
            cfg,
            api,
            journal,
            acl,
            filters,
            scanner: Arc::new(LocalScanner::default()),
            status: Arc::new(SyncStatusMap::new()),
            cycle_lock: tokio::sync::Mutex::new(()),
            sync_trigger: Notify::new(),
            ws_out: Mutex::new(None),
        })
    }

    pub fn status_map(&self) -> &Arc<SyncStatusMap> {
        &self.status
    }

    /// Wire the outbound event-channel sender used for inline priority
    /// uploads. `run` does this itself; standalone embedders may too.
    pub fn set_event_sender(&self, tx: mpsc::Sender<Vec<u8>>) {
        *self.ws_out.lock().expect("ws sender lock") = Some(tx);
    }

    /// Run until `shutdown` fires: one initial cycle, then the periodic
    /// timer, the websocket consumer and the watcher consumer in parallel.
    /// The journal is closed on the way out.
    pub async fn run(self: Arc<Self>, shutdown: Arc<Notify>) -> Result<()> {
        // Notify has no memory; latch it into a watch channel so loops that
        // are mid-cycle when it fires still observe the stop.
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.notified().await;
                let _ = stop_tx.send(true);
            });
        }

        self.bootstrap_acl().await;

        match self.sync_once().await {
            Ok(stats) => log_cycle("initial sync", &stats),
            Err(err) => crate::logging::error(format!("initial sync failed: {err:#}")),
        }

        let (ws_in_tx, ws_in_rx) = mpsc::channel::<Decoded>(256);
        let (ws_out_tx, ws_out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.set_event_sender(ws_out_tx);

        let ws_task = {
            let url = self.api.events_url()?;
            let shutdown = shutdown.clone();
            tokio::spawn(crate::ws::run_event_channel(url, ws_in_tx, ws_out_rx, shutdown))
        };

        let (watch_tx, watch_rx) = mpsc::channel::<WatchEvent>(1024);
        let datasites_root = self.cfg.datasites_root();
        fs::create_dir_all(&datasites_root)
            .with_context(|| format!("create {}", datasites_root.display()))?;
        let _watcher = watcher::start_watcher(&datasites_root, watch_tx)?;

        let timer_task = tokio::spawn(self.clone().timer_loop(stop_rx.clone()));
        let ws_consumer = tokio::spawn(self.clone().ws_consumer_loop(ws_in_rx, stop_rx.clone()));
        let watch_consumer =
            tokio::spawn(self.clone().watch_consumer_loop(watch_rx, stop_rx.clone()));

        let mut stop = stop_rx;
        let _ = stop.changed().await;

        let _ = timer_task.await;
        let _ = ws_consumer.await;
        let _ = watch_consumer.await;
        ws_task.abort();
        let _ = ws_task.await;

        self.journal.close()?;
        crate::logging::info("sync engine stopped");
        Ok(())
    }

    async fn timer_loop(self: Arc<Self>, mut stop: tokio::sync::watch::Receiver<bool>) {
        loop {
            // The sleep restarts after each completed cycle, so a slow cycle
            // never produces a burst of back-to-back ticks.
            tokio::select! {
                _ = stop.changed() => return,
                _ = tokio::time::sleep(self.cfg.sync_interval) => {}
                _ = self.sync_trigger.notified() => {}
            }
            tokio::select! {
                _ = stop.changed() => return,
                res = self.sync_once() => {
                    match res {
                        Ok(stats) => {
                            if stats.uploads + stats.downloads + stats.conflicts > 0 {
                                log_cycle("sync cycle", &stats);
                            }
                        }
                        Err(err) => {
                            let overlapping = matches!(
                                err.downcast_ref::<EngineError>(),
                                Some(EngineError::SyncAlreadyRunning)
                            );
                            if !overlapping {
                                crate::logging::error(format!("sync cycle failed: {err:#}"));
                            }
                        }
                    }
                }
            }
        }
    }

    async fn ws_consumer_loop(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Decoded>,
        mut stop: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = stop.changed() => return,
                msg = inbound.recv() => {
                    let Some(msg) = msg else { return };
                    self.handle_ws_event(msg);
                }
            }
        }
    }

    async fn watch_consumer_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<WatchEvent>,
        mut stop: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = stop.changed() => return,
                ev = events.recv() => {
                    let Some(ev) = ev else { return };
                    self.handle_watch_event(ev).await;
                }
            }
        }
    }

    /// One guarded full-sync cycle. A concurrent caller gets
    /// `SyncAlreadyRunning` instead of waiting.
    pub async fn sync_once(&self) -> Result<CycleStats> {
        let Ok(_cycle) = self.cycle_lock.try_lock() else {
            return Err(EngineError::SyncAlreadyRunning.into());
        };
        let started = Instant::now();
        let datasites_root = self.cfg.datasites_root();

        // Remote view first: without it there is nothing safe to decide.
        let view = self.api.datasite_view().await.map_err(|err| {
            anyhow::Error::new(EngineError::RemoteFetch {
                reason: format!("{err:#}"),
            })
        })?;
        let mut remote: HashMap<String, FileMetadata> = HashMap::new();
        for file in view.files {
            if !syftpath::is_datasite_key(&file.key)
                || SyncFilters::is_marked_rel_path(&file.key)
                || self
                    .filters
                    .ignore
                    .should_ignore_rel(Path::new(&file.key), false)
            {
                continue;
            }
            remote.insert(
                file.key.clone(),
                FileMetadata {
                    path: file.key,
                    size: file.size,
                    etag: file.etag,
                    version: file.version,
                    last_modified: file.last_modified,
                },
            );
        }

        let scan = self.scanner.scan(&datasites_root, &self.filters.ignore)?;
        let local = scan.metadata();

        let seeded = self.journal.rebuild_if_empty(&local, &remote)?;
        if seeded > 0 {
            crate::logging::info(format!("journal reseeded {seeded} rows from matching state"));
        }

        let journal_state = self.journal.state();
        let syncing = self.status.snapshot();
        let skip = SkipSets {
            syncing: &syncing,
            conflicted: &scan.conflicted,
            ignore: Some(&self.filters.ignore),
        };
        let mut batches = reconcile::reconcile(&local, &remote, &journal_state, &skip);

        let stats = CycleStats {
            uploads: batches.write_remote.len(),
            downloads: batches.write_local.len(),
            remote_deletes: batches.delete_remote.len(),
            local_deletes: batches.delete_local.len(),
            conflicts: batches.conflicts.len(),
            cleanups: batches.cleanups.len(),
            unchanged: batches.unchanged.len(),
            ignored: batches.ignored.len(),
        };

        // Heal journal rows for keys where both sides already agree.
        for op in &batches.unchanged {
            if let (Some(_), Some(r)) = (&op.local, &op.remote) {
                let healed = match &op.last_synced {
                    Some(j) => !j.is_equivalent(r),
                    None => true,
                };
                if healed {
                    if let Err(err) = self.journal.set(r.clone()) {
                        crate::logging::error(format!(
                            "journal heal failed for {}: {err:#}",
                            op.rel_path
                        ));
                    }
                }
            }
        }

        // Conflicts quarantine the local copy first, then the remote winner
        // is pulled back in the same cycle through the download batch.
        let conflict_ops = std::mem::take(&mut batches.conflicts);
        for op in conflict_ops {
            let abs = datasites_root.join(&op.rel_path);
            match mark_conflicted(&abs) {
                Ok(Some(sidecar)) => {
                    crate::logging::info(format!(
                        "{} (local copy in {})",
                        EngineError::ConflictMarked {
                            key: op.rel_path.clone(),
                        },
                        sidecar.display()
                    ));
                }
                Ok(None) => {}
                Err(err) => {
                    crate::logging::error(format!(
                        "conflict mark failed for {}: {err:#}",
                        op.rel_path
                    ));
                    continue;
                }
            }
            if let Err(err) = self.journal.delete(&op.rel_path) {
                crate::logging::error(format!("journal delete failed for {}: {err:#}", op.rel_path));
            }
            if op.remote.is_some() {
                batches.write_local.push(op);
            }
        }

        tokio::join!(
            self.run_uploads(batches.write_remote, &scan),
            self.run_downloads(batches.write_local, &datasites_root),
            self.run_remote_deletes(batches.delete_remote),
            self.run_local_deletes(batches.delete_local, &datasites_root),
            self.run_cleanups(batches.cleanups),
        );

        crate::logging::info_kv(
            "sync cycle done",
            &[
                ("elapsed_ms", &started.elapsed().as_millis().to_string()),
                ("uploads", &stats.uploads.to_string()),
                ("downloads", &stats.downloads.to_string()),
                ("remote_deletes", &stats.remote_deletes.to_string()),
                ("local_deletes", &stats.local_deletes.to_string()),
                ("conflicts", &stats.conflicts.to_string()),
                ("cleanups", &stats.cleanups.to_string()),
                ("ignored", &stats.ignored.to_string()),
            ],
        );
        Ok(stats)
    }

    async fn run_uploads(&self, ops: Vec<SyncOperation>, scan: &ScanResult) {
        stream::iter(ops)
            .for_each_concurrent(UPLOAD_WORKERS, |op| self.upload_one(op, scan))
            .await;
    }

    async fn upload_one(&self, op: SyncOperation, scan: &ScanResult) {
        let key = op.rel_path;
        let Some(_guard) = self.status.begin(&key) else {
            return;
        };
        let Some(entry) = scan.files.get(&key) else {
            return;
        };

        // A standing rejected sidecar stops re-upload attempts until the
        // user resolves it; dropping the journal row lets a remote winner in.
        if rejected_sidecar_exists(&entry.abs_path) {
            let _ = self.journal.delete(&key);
            return;
        }

        // Another path (priority upload, inline write) may have synced this
        // key since the scan; skip when the journal already agrees.
        if let Some(j) = self.journal.get(&key) {
            if !entry.meta.etag.is_empty()
                && normalize_etag(&j.etag) == normalize_etag(&entry.meta.etag)
            {
                return;
            }
        }

        if let Err(err) = self.check_upload_allowed(&key, entry.meta.size) {
            crate::logging::error(format!("upload blocked for {key}: {err:#}"));
            return;
        }

        match self.api.upload_blob(&key, &entry.abs_path).await {
            Ok(resp) => {
                let last_modified = resp.last_modified_or_now();
                let meta = FileMetadata {
                    path: key.clone(),
                    size: resp.size,
                    etag: resp.etag,
                    version: resp.version,
                    last_modified,
                };
                if let Err(err) = self.journal.set(meta) {
                    crate::logging::error(format!("journal set failed for {key}: {err:#}"));
                }
            }
            Err(err) => {
                let forbidden = err
                    .downcast_ref::<HttpStatusError>()
                    .is_some_and(|e| e.status == StatusCode::FORBIDDEN);
                if forbidden {
                    let _ = mark_rejected(&entry.abs_path);
                    let _ = self.journal.delete(&key);
                    crate::logging::error(format!("upload rejected by server for {key}"));
                } else {
                    crate::logging::error(format!(
                        "{:#}",
                        EngineError::Upload {
                            key: key.clone(),
                            reason: format!("{err:#}"),
                        }
                    ));
                }
            }
        }
    }

    async fn run_downloads(&self, ops: Vec<SyncOperation>, datasites_root: &Path) {
        if ops.is_empty() {
            return;
        }

        // Duplicate content downloads once: group targets by remote etag.
        let mut groups: HashMap<String, DownloadGroup> = HashMap::new();
        for op in ops {
            let Some(remote) = op.remote else { continue };
            let group = groups
                .entry(normalize_etag(&remote.etag))
                .or_insert_with(|| DownloadGroup {
                    representative: op.rel_path.clone(),
                    size: remote.size,
                    targets: Vec::new(),
                });
            group.targets.push((op.rel_path, remote));
        }

        let rep_keys: Vec<String> = groups.values().map(|g| g.representative.clone()).collect();
        let presigned = match self
            .api
            .get_blob_presigned(&PresignedParams { keys: rep_keys })
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                crate::logging::error(format!("presigned download request failed: {err:#}"));
                return;
            }
        };
        for e in &presigned.errors {
            crate::logging::error(format!("presign failed for {}: {}", e.key, e.error));
        }
        let url_by_key: HashMap<String, String> = presigned
            .urls
            .into_iter()
            .map(|u| (u.key, u.url))
            .collect();

        // Lower score downloads earlier: own files, then ACL documents, then
        // RPC traffic, then everything else smallest-first.
        let mut heap: BinaryHeap<Reverse<(i64, String)>> = BinaryHeap::new();
        let mut by_etag: HashMap<String, DownloadGroup> = HashMap::new();
        for (etag, group) in groups {
            if !url_by_key.contains_key(&group.representative) {
                continue;
            }
            let score = group
                .targets
                .iter()
                .map(|(key, _)| download_priority(key, &self.cfg.owner_email, group.size))
                .min()
                .unwrap_or(i64::MAX);
            heap.push(Reverse((score, etag.clone())));
            by_etag.insert(etag, group);
        }
        let mut ordered = Vec::with_capacity(by_etag.len());
        while let Some(Reverse((_, etag))) = heap.pop() {
            if let Some(group) = by_etag.remove(&etag) {
                let url = url_by_key[&group.representative].clone();
                ordered.push((etag, url, group));
            }
        }

        let tmp_dir = self.cfg.downloads_tmp_dir();
        if let Err(err) = fs::create_dir_all(&tmp_dir) {
            crate::logging::error(format!("create downloads dir failed: {err}"));
            return;
        }

        stream::iter(ordered)
            .for_each_concurrent(DOWNLOAD_WORKERS, |(etag, url, group)| {
                self.download_group(etag, url, group, datasites_root, &tmp_dir)
            })
            .await;
    }

    async fn download_group(
        &self,
        etag: String,
        url: String,
        group: DownloadGroup,
        datasites_root: &Path,
        tmp_dir: &Path,
    ) {
        // Hold a guard per destination; destinations already in flight are
        // left for the next cycle.
        let mut targets = Vec::new();
        let mut guards = Vec::new();
        for (key, meta) in group.targets {
            match self.status.begin(&key) {
                Some(guard) => {
                    guards.push(guard);
                    targets.push((key, meta));
                }
                None => continue,
            }
        }
        if targets.is_empty() {
            return;
        }

        let tmp = tmp_dir.join(format!("{etag}.tmp-{}", uuid::Uuid::new_v4()));
        let _tmp_guard = TempFileGuard { path: tmp.clone() };

        if let Err(err) = http::download_url_to_file(self.api.http(), &url, &tmp).await {
            crate::logging::error(format!(
                "{:#}",
                EngineError::Download {
                    key: targets[0].0.clone(),
                    reason: format!("{err:#}"),
                }
            ));
            return;
        }

        let local_etag = scanner::compute_etag(&tmp).unwrap_or_default();
        for (key, remote_meta) in targets {
            let dest = datasites_root.join(&key);
            if let Err(err) = place_file(&tmp, &dest) {
                crate::logging::error(format!("place download failed for {key}: {err:#}"));
                continue;
            }
            if let Err(err) = self.journal.set(remote_meta.clone()) {
                crate::logging::error(format!("journal set failed for {key}: {err:#}"));
            }
            let etag_for_cache = if local_etag.is_empty() {
                remote_meta.etag.clone()
            } else {
                local_etag.clone()
            };
            self.scanner.note_synced(
                &key,
                remote_meta.size,
                scanner::mtime_nanos(&dest),
                &etag_for_cache,
            );
            if syftpath::is_acl_file(&key) {
                if let Err(err) = self.load_acl_file(&dest) {
                    crate::logging::error(format!("acl reload failed for {key}: {err:#}"));
                }
            }
        }
    }

    async fn run_remote_deletes(&self, ops: Vec<SyncOperation>) {
        if ops.is_empty() {
            return;
        }
        let mut keys = Vec::new();
        let mut guards = Vec::new();
        for op in &ops {
            if let Some(guard) = self.status.begin(&op.rel_path) {
                guards.push(guard);
                keys.push(op.rel_path.clone());
            }
        }
        if keys.is_empty() {
            return;
        }
        match self.api.delete_blobs(&keys).await {
            Ok(resp) => {
                for key in resp.deleted {
                    if let Err(err) = self.journal.delete(&key) {
                        crate::logging::error(format!("journal delete failed for {key}: {err:#}"));
                    }
                }
                for e in resp.errors {
                    crate::logging::error(format!(
                        "{:#}",
                        EngineError::Delete {
                            key: e.key,
                            reason: e.error,
                        }
                    ));
                }
            }
            Err(err) => {
                crate::logging::error(format!("remote delete batch failed: {err:#}"));
            }
        }
    }

    async fn run_local_deletes(&self, ops: Vec<SyncOperation>, datasites_root: &Path) {
        for op in ops {
            let key = op.rel_path;
            let Some(_guard) = self.status.begin(&key) else {
                continue;
            };
            let abs = datasites_root.join(&key);
            if abs.exists() {
                let removed = match fs::metadata(&abs) {
                    Ok(meta) if meta.is_dir() => fs::remove_dir_all(&abs),
                    Ok(_) => fs::remove_file(&abs),
                    Err(err) => Err(err),
                };
                if let Err(err) = removed {
                    crate::logging::error(format!("local delete failed for {key}: {err}"));
                    continue;
                }
            }
            if let Err(err) = self.journal.delete(&key) {
                crate::logging::error(format!("journal delete failed for {key}: {err:#}"));
            }
            if syftpath::is_acl_file(&key) {
                if let Ok(dir) = syftpath::without_acl_path(&key) {
                    self.acl.remove_rule_set(&dir);
                }
            }
        }
    }

    async fn run_cleanups(&self, ops: Vec<SyncOperation>) {
        for op in ops {
            if let Err(err) = self.journal.delete(&op.rel_path) {
                crate::logging::error(format!(
                    "journal cleanup failed for {}: {err:#}",
                    op.rel_path
                ));
            }
        }
    }

    fn check_upload_allowed(&self, key: &str, size: i64) -> Result<()> {
        self.acl.check_access(
            &self.cfg.owner_email,
            &FileRef::file(key, size),
            AccessLevel::Write,
        )
    }

    /// Load every `syft.pub.yaml` under the datasites root into the rule
    /// tree, a bounded number at a time.
    pub async fn bootstrap_acl(&self) {
        let root = self.cfg.datasites_root();
        if !root.exists() {
            return;
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file()
                && entry.file_name() == syftpath::ACL_FILE_NAME
            {
                files.push(entry.path().to_path_buf());
            }
        }
        stream::iter(files)
            .for_each_concurrent(ACL_BOOTSTRAP_WORKERS, |abs| async move {
                if let Err(err) = self.load_acl_file(&abs) {
                    crate::logging::error(format!(
                        "acl load failed for {}: {err:#}",
                        abs.display()
                    ));
                }
            })
            .await;
        crate::logging::info(format!(
            "acl bootstrap complete rulesets={}",
            self.acl.rule_set_count()
        ));
    }

    fn load_acl_file(&self, abs: &Path) -> Result<()> {
        if !aclspec::exists(abs) {
            // Symlinked or vanished ACL documents are never honored.
            return Ok(());
        }
        let root = self.cfg.datasites_root();
        let rel = abs
            .strip_prefix(&root)
            .with_context(|| format!("strip prefix {}", abs.display()))?
            .to_string_lossy()
            .replace('\\', "/");
        let dir = syftpath::without_acl_path(&rel)?;
        let rs = aclspec::load(abs, &dir)?;
        self.acl.load_rule_set(&rs)?;
        Ok(())
    }

    /// Dispatch one inbound websocket message.
    pub fn handle_ws_event(&self, msg: Decoded) {
        match msg {
            Decoded::System(m) => {
                crate::logging::info_kv(
                    "server message",
                    &[("version", &m.system_version), ("message", &m.message)],
                );
            }
            Decoded::Error(e) => {
                if e.code == 403 && !e.path.is_empty() {
                    self.mark_remote_rejection(&e.path);
                } else {
                    crate::logging::error(format!(
                        "server error code={} path={} message={}",
                        e.code, e.path, e.message
                    ));
                }
            }
            Decoded::FileWrite(fw) => {
                if let Err(err) = self.apply_inline_write(&fw) {
                    crate::logging::error(format!(
                        "inline write failed for {}: {err:#}",
                        fw.path
                    ));
                }
            }
            Decoded::FileDelete(fd) => {
                if let Err(err) = self.apply_inline_delete(&fd.path) {
                    crate::logging::error(format!(
                        "inline delete failed for {}: {err:#}",
                        fd.path
                    ));
                }
            }
            Decoded::Other { id, typ } => {
                crate::logging::info(format!("unhandled server message id={id} typ={typ}"));
            }
        }
    }

    fn mark_remote_rejection(&self, path: &str) {
        let Ok(key) = syftpath::clean(path) else {
            return;
        };
        let abs = self.cfg.datasites_root().join(&key);
        if let Err(err) = mark_rejected(&abs) {
            crate::logging::error(format!("reject mark failed for {key}: {err:#}"));
        }
        let _ = self.journal.delete(&key);
        crate::logging::warn(format!("server rejected write for {key}"));
    }

    /// Inline remote-to-local delivery: verify, write, journal.
    pub fn apply_inline_write(&self, fw: &FileWriteMsg) -> Result<()> {
        let key = syftpath::clean(&fw.path)?;
        if SyncFilters::is_marked_rel_path(&key)
            || self.filters.ignore.should_ignore_rel(Path::new(&key), false)
        {
            return Ok(());
        }
        let Some(content) = &fw.content else {
            // Content-free notifications are picked up by the next cycle.
            self.sync_trigger.notify_one();
            return Ok(());
        };
        let computed = scanner::content_etag(content);
        if normalize_etag(&computed) != normalize_etag(&fw.etag) {
            anyhow::bail!(
                "etag mismatch for {key}: server {} computed {computed}",
                fw.etag
            );
        }

        let Some(_guard) = self.status.begin(&key) else {
            return Ok(());
        };
        let abs = self.cfg.datasites_root().join(&key);
        ensure_parent_dirs(&abs)?;
        write_file_resolving_conflicts(&abs, content)?;

        self.journal.set(FileMetadata {
            path: key.clone(),
            size: content.len() as i64,
            etag: fw.etag.clone(),
            version: String::new(),
            last_modified: Utc::now(),
        })?;
        self.scanner.note_synced(
            &key,
            content.len() as i64,
            scanner::mtime_nanos(&abs),
            &computed,
        );

        if syftpath::is_acl_file(&key) {
            if let Err(err) = self.load_acl_file(&abs) {
                crate::logging::error(format!("acl reload failed for {key}: {err:#}"));
            }
        }
        Ok(())
    }

    fn apply_inline_delete(&self, path: &str) -> Result<()> {
        let key = syftpath::clean(path)?;
        if SyncFilters::is_marked_rel_path(&key) {
            return Ok(());
        }
        let Some(_guard) = self.status.begin(&key) else {
            return Ok(());
        };
        let abs = self.cfg.datasites_root().join(&key);
        if abs.exists() {
            fs::remove_file(&abs).with_context(|| format!("remove {}", abs.display()))?;
        }
        self.journal.delete(&key)?;
        if syftpath::is_acl_file(&key) {
            let dir = syftpath::without_acl_path(&key)?;
            self.acl.remove_rule_set(&dir);
        }
        Ok(())
    }

    /// Dispatch one file-watcher event.
    pub async fn handle_watch_event(&self, ev: WatchEvent) {
        let root = self.cfg.datasites_root();
        let Ok(rel) = ev.path.strip_prefix(&root) else {
            return;
        };
        let key = rel.to_string_lossy().replace('\\', "/");
        if key.is_empty()
            || SyncFilters::is_marked_rel_path(&key)
            || self.filters.ignore.should_ignore_rel(rel, false)
        {
            return;
        }

        match ev.kind {
            WatchKind::Remove => {
                if syftpath::is_acl_file(&key) {
                    if let Ok(dir) = syftpath::without_acl_path(&key) {
                        self.acl.remove_rule_set(&dir);
                    }
                }
                self.sync_trigger.notify_one();
            }
            WatchKind::Write => {
                let Ok(meta) = fs::metadata(&ev.path) else {
                    return;
                };
                if meta.is_dir() {
                    return;
                }
                if syftpath::is_acl_file(&key) {
                    if let Err(err) = self.load_acl_file(&ev.path) {
                        crate::logging::error(format!("acl reload failed for {key}: {err:#}"));
                    }
                }
                if self.filters.priority.should_prioritize_rel(rel, false) {
                    if let Err(err) = self.priority_upload(&key, &ev.path).await {
                        crate::logging::error(format!(
                            "priority upload failed for {key}: {err:#}"
                        ));
                    }
                } else {
                    self.sync_trigger.notify_one();
                }
            }
        }
    }

    /// Short-circuit upload for priority paths: inline over the websocket
    /// when small enough, immediate HTTP upload otherwise. Either way the
    /// journal and scan cache are updated so the next cycle sees the path as
    /// unchanged.
    pub async fn priority_upload(&self, key: &str, abs: &Path) -> Result<()> {
        let Some(_guard) = self.status.begin(key) else {
            return Ok(());
        };
        let meta = fs::metadata(abs).with_context(|| format!("stat {}", abs.display()))?;
        let size = meta.len() as i64;
        let etag = scanner::compute_etag(abs)?;

        if let Some(j) = self.journal.get(key) {
            if normalize_etag(&j.etag) == normalize_etag(&etag) {
                self.scanner
                    .note_synced(key, size, scanner::mtime_nanos(abs), &etag);
                return Ok(());
            }
        }

        self.check_upload_allowed(key, size)?;

        let sender = self.ws_out.lock().expect("ws sender lock").clone();
        let inline_capable = size as usize <= INLINE_WRITE_MAX_BYTES && sender.is_some();

        if inline_capable {
            let content = fs::read(abs).with_context(|| format!("read {}", abs.display()))?;
            let frame = wsproto::encode_file_write(
                &uuid::Uuid::new_v4().to_string(),
                &FileWriteMsg {
                    path: key.to_string(),
                    etag: etag.clone(),
                    length: size,
                    content: Some(content),
                },
            )?;
            let sent = match sender {
                Some(tx) => tx.send(frame).await.is_ok(),
                None => false,
            };
            if sent {
                self.journal.set(FileMetadata {
                    path: key.to_string(),
                    size,
                    etag: etag.clone(),
                    version: String::new(),
                    last_modified: Utc::now(),
                })?;
                self.scanner
                    .note_synced(key, size, scanner::mtime_nanos(abs), &etag);
                return Ok(());
            }
        }

        // Oversized or channel unavailable: upload over HTTP right away.
        let resp = self.api.upload_blob(key, abs).await?;
        let last_modified = resp.last_modified_or_now();
        self.journal.set(FileMetadata {
            path: key.to_string(),
            size: resp.size,
            etag: resp.etag,
            version: resp.version,
            last_modified,
        })?;
        self.scanner
            .note_synced(key, size, scanner::mtime_nanos(abs), &etag);
        Ok(())
    }
}

struct DownloadGroup {
    representative: String,
    size: i64,
    targets: Vec<(String, FileMetadata)>,
}

struct TempFileGuard {
    path: PathBuf,
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn log_cycle(label: &str, stats: &CycleStats) {
    crate::logging::info(format!(
        "{label}: up={} down={} rdel={} ldel={} conflicts={} cleanups={}",
        stats.uploads,
        stats.downloads,
        stats.remote_deletes,
        stats.local_deletes,
        stats.conflicts,
        stats.cleanups
    ));
}

fn download_priority(key: &str, owner_email: &str, size: i64) -> i64 {
    if syftpath::is_owner(key, owner_email) {
        return 0;
    }
    if syftpath::is_acl_file(key) {
        return 1;
    }
    if key.contains("/rpc/") {
        return 2;
    }
    size.saturating_add(key.len() as i64)
}

fn sidecar_dir(abs: &Path, suffix: &str) -> Option<PathBuf> {
    let name = abs.file_name()?.to_str()?;
    Some(abs.with_file_name(format!("{name}{suffix}")))
}

/// Move `abs` into its `<basename>.conflicted/` sidecar directory, rotating
/// any previously quarantined copy with a timestamp suffix.
pub fn mark_conflicted(abs: &Path) -> Result<Option<PathBuf>> {
    if !abs.exists() {
        return Ok(None);
    }
    let Some(dir) = sidecar_dir(abs, CONFLICTED_SUFFIX) else {
        return Ok(None);
    };
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let name = abs
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("conflicted");
    let dest = dir.join(name);
    if dest.exists() {
        let ts = Utc::now().format("%Y%m%d%H%M%S");
        let rotated = dir.join(format!("{name}.{ts}"));
        let _ = fs::rename(&dest, rotated);
    }
    fs::rename(abs, &dest)
        .with_context(|| format!("move {} into sidecar", abs.display()))?;
    Ok(Some(dest))
}

/// Move `abs` into its `<basename>.rejected/` sidecar. A path with an
/// existing rejected copy is deleted instead of rotated, so repeated server
/// rejections cannot accumulate quarantined files.
pub fn mark_rejected(abs: &Path) -> Result<Option<PathBuf>> {
    if !abs.exists() {
        return Ok(None);
    }
    let Some(dir) = sidecar_dir(abs, REJECTED_SUFFIX) else {
        return Ok(None);
    };
    if dir.is_dir() && dir.read_dir().map(|mut d| d.next().is_some()).unwrap_or(false) {
        let _ = fs::remove_file(abs);
        return Ok(None);
    }
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let name = abs
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("rejected");
    let dest = dir.join(name);
    fs::rename(abs, &dest)
        .with_context(|| format!("move {} into sidecar", abs.display()))?;
    Ok(Some(dest))
}

pub fn rejected_sidecar_exists(abs: &Path) -> bool {
    sidecar_dir(abs, REJECTED_SUFFIX).is_some_and(|d| d.is_dir())
}

pub fn conflicted_sidecar_exists(abs: &Path) -> bool {
    sidecar_dir(abs, CONFLICTED_SUFFIX).is_some_and(|d| d.is_dir())
}

/// Ensure parent directories exist for `target`. If an ancestor exists as a
/// regular file, remove it so the remote directory structure can land.
fn ensure_parent_dirs(target: &Path) -> Result<()> {
    let Some(parent) = target.parent() else {
        return Ok(());
    };
    match fs::create_dir_all(parent) {
        Ok(_) => Ok(()),
        Err(_) => {
            let mut cur = parent.to_path_buf();
            loop {
                if cur.exists() {
                    let meta = fs::metadata(&cur)?;
                    if !meta.is_dir() {
                        fs::remove_file(&cur)?;
                    }
                    break;
                }
                match cur.parent() {
                    Some(up) => cur = up.to_path_buf(),
                    None => break,
                }
            }
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
            Ok(())
        }
    }
}

/// Copy the staged download into place, removing whatever blocks the path.
fn place_file(tmp: &Path, dest: &Path) -> Result<()> {
    ensure_parent_dirs(dest)?;
    if dest.exists() {
        let meta = fs::symlink_metadata(dest)?;
        if meta.is_dir() {
            fs::remove_dir_all(dest)?;
        } else {
            let _ = fs::remove_file(dest);
        }
    }
    fs::copy(tmp, dest).with_context(|| format!("copy into {}", dest.display()))?;
    Ok(())
}

/// Write `bytes` to `target`, removing a directory squatting on the path.
fn write_file_resolving_conflicts(target: &Path, bytes: &[u8]) -> Result<()> {
    match fs::write(target, bytes) {
        Ok(_) => Ok(()),
        Err(err) => {
            if target.exists() {
                let meta = fs::metadata(target)?;
                if meta.is_dir() {
                    fs::remove_dir_all(target)?;
                    fs::write(target, bytes)?;
                    return Ok(());
                }
            }
            Err(err).with_context(|| format!("write {}", target.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn make_temp_dir() -> PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("syftbox-engine-test-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn conflict_sidecar_holds_the_local_copy() {
        let root = make_temp_dir();
        let dir = root.join("alice@example.com/docs");
        fs::create_dir_all(&dir).unwrap();
        let orig = dir.join("paper.tex");
        fs::write(&orig, b"local edits").unwrap();

        let dest = mark_conflicted(&orig).unwrap().unwrap();
        assert_eq!(dest, dir.join("paper.tex.conflicted/paper.tex"));
        assert_eq!(fs::read(&dest).unwrap(), b"local edits");
        assert!(!orig.exists());
        assert!(conflicted_sidecar_exists(&orig));

        // Marking again rotates the previous quarantined copy.
        fs::write(&orig, b"newer edits").unwrap();
        mark_conflicted(&orig).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"newer edits");
        let rotated = fs::read_dir(dir.join("paper.tex.conflicted"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("paper.tex.")
            })
            .count();
        assert_eq!(rotated, 1);
    }

    #[test]
    fn rejected_sidecar_dedupes_without_rotation() {
        let root = make_temp_dir();
        let dir = root.join("alice@example.com/out");
        fs::create_dir_all(&dir).unwrap();
        let orig = dir.join("report.csv");
        fs::write(&orig, b"v1").unwrap();

        let dest = mark_rejected(&orig).unwrap().unwrap();
        assert_eq!(dest, dir.join("report.csv.rejected/report.csv"));
        assert!(rejected_sidecar_exists(&orig));

        // A recreated file is dropped, not rotated in.
        fs::write(&orig, b"v2").unwrap();
        assert!(mark_rejected(&orig).unwrap().is_none());
        assert!(!orig.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"v1");
        assert_eq!(
            fs::read_dir(dir.join("report.csv.rejected")).unwrap().count(),
            1
        );
    }

    #[test]
    fn missing_file_is_a_noop_mark() {
        let root = make_temp_dir();
        assert!(mark_conflicted(&root.join("ghost.txt")).unwrap().is_none());
        assert!(mark_rejected(&root.join("ghost.txt")).unwrap().is_none());
    }

    #[test]
    fn download_priority_ladder() {
        let owner = "alice@example.com";
        assert_eq!(
            download_priority("alice@example.com/big/file.bin", owner, 1 << 30),
            0
        );
        assert_eq!(
            download_priority("bob@example.com/public/syft.pub.yaml", owner, 1 << 30),
            1
        );
        assert_eq!(
            download_priority("bob@example.com/app_data/rpc/x.request", owner, 1 << 30),
            2
        );
        let small = download_priority("bob@example.com/a.txt", owner, 100);
        let large = download_priority("bob@example.com/b.txt", owner, 10_000);
        assert!(small > 2 && small < large);
    }

    #[test]
    fn ensure_parent_dirs_replaces_blocking_file() {
        let root = make_temp_dir();
        let blocking = root.join("alice@example.com");
        fs::write(&blocking, b"not a dir").unwrap();

        let target = blocking.join("public/a.txt");
        ensure_parent_dirs(&target).unwrap();
        assert!(blocking.is_dir());
        fs::write(&target, b"ok").unwrap();
    }

    #[test]
    fn place_file_replaces_dir_squatting_on_dest() {
        let root = make_temp_dir();
        let tmp = root.join("staged.tmp");
        fs::write(&tmp, b"payload").unwrap();

        let dest = root.join("alice@example.com/data.bin");
        fs::create_dir_all(&dest).unwrap();
        place_file(&tmp, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
        // Source stays for further destinations of the same etag.
        assert!(tmp.exists());
    }
}
