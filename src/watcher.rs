use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Write,
    Remove,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchKind,
}

/// Watch `root` recursively, forwarding create/modify/remove paths into a
/// bounded channel. The returned watcher must stay alive for events to keep
/// flowing; the bounded channel gives natural back-pressure against event
/// storms.
pub fn start_watcher(root: &Path, tx: mpsc::Sender<WatchEvent>) -> Result<RecommendedWatcher> {
    let mut watcher =
        notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else { return };
            let kind = match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) => WatchKind::Write,
                EventKind::Remove(_) => WatchKind::Remove,
                _ => return,
            };
            for path in event.paths {
                let _ = tx.blocking_send(WatchEvent { path, kind });
            }
        })
        .context("create file watcher")?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("watch {}", root.display()))?;
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn make_temp_dir() -> PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("syftbox-watcher-test-{nanos}"));
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_events_are_forwarded() {
        let root = make_temp_dir();
        let (tx, mut rx) = mpsc::channel(64);
        let _watcher = start_watcher(&root, tx).unwrap();

        // Give the backend a moment to arm before producing events.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let target = root.join("a.txt");
        std::fs::write(&target, b"hello").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let ev = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("no watch event before deadline")
                .expect("watch channel closed");
            if ev.path == target && ev.kind == WatchKind::Write {
                break;
            }
        }
    }
}
