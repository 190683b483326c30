use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Notify;

use crate::acl::AclService;
use crate::config::Config;
use crate::engine::{EngineConfig, SyncEngine, DEFAULT_SYNC_INTERVAL};
use crate::filters::SyncFilters;
use crate::http::ApiClient;
use crate::journal::SyncJournal;
use crate::workspace;

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub log_path: Option<PathBuf>,
    pub sync_interval: Option<Duration>,
    pub healthz_max_attempts: Option<usize>,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            log_path: None,
            sync_interval: None,
            healthz_max_attempts: Some(60),
        }
    }
}

/// Run the sync daemon on the current tokio runtime until `shutdown` fires.
pub async fn run_daemon_with_shutdown(
    cfg: Config,
    opts: DaemonOptions,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let log_path = opts.log_path.unwrap_or_else(|| daemon_log_path(&cfg));
    crate::logging::init_log_file(&log_path)?;
    crate::logging::info(format!(
        "daemon start version={} email={} data_dir={}",
        env!("CARGO_PKG_VERSION"),
        cfg.email,
        cfg.data_dir.display()
    ));

    workspace::ensure_workspace_layout(&cfg.data_dir, &cfg.email)?;
    let _lock = workspace::WorkspaceLock::try_lock(&cfg.data_dir)
        .context("another client owns this workspace")?;

    let api = Arc::new(ApiClient::new(
        &cfg.server_url,
        &cfg.email,
        cfg.access_token.as_deref(),
    )?);
    wait_for_server(&api, opts.healthz_max_attempts.unwrap_or(60), &shutdown).await?;

    let mut engine_cfg = EngineConfig::new(&cfg.data_dir, &cfg.email);
    engine_cfg.sync_interval = opts.sync_interval.unwrap_or(DEFAULT_SYNC_INTERVAL);

    let journal = Arc::new(SyncJournal::open(&engine_cfg.journal_path())?);
    let filters = Arc::new(SyncFilters::load(&engine_cfg.datasites_root())?);
    let acl = Arc::new(AclService::new());

    let engine = SyncEngine::new(engine_cfg, api, journal, acl, filters);
    engine.run(shutdown).await
}

async fn wait_for_server(
    api: &ApiClient,
    max_attempts: usize,
    shutdown: &Arc<Notify>,
) -> Result<()> {
    let mut last_err = None;
    for attempt in 0..max_attempts.max(1) {
        match api.healthz().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                if attempt == 0 {
                    crate::logging::warn(format!("server not ready: {err:#}"));
                }
                last_err = Some(err);
            }
        }
        tokio::select! {
            _ = shutdown.notified() => anyhow::bail!("shutdown while waiting for server"),
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }
    Err(last_err
        .unwrap_or_else(|| anyhow::anyhow!("unreachable"))
        .context("server health check failed"))
}

fn daemon_log_path(cfg: &Config) -> PathBuf {
    if let Some(p) = cfg.config_path.as_ref().and_then(|p| p.parent()) {
        return p.join("logs").join("syftbox.log");
    }
    cfg.data_dir
        .join(".syftbox")
        .join("logs")
        .join("syftbox.log")
}
