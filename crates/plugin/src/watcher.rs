//! Plugin directory watching with per-file debounce.
//!
//! Filesystem editors produce bursts of events per save; each file's
//! events are coalesced over a debounce window (latest kind wins) before
//! reaching the manager.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::PluginError;

/// Default debounce window.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

/// Coalesced watch event delivered to the manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Added(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            Self::Added(p) | Self::Modified(p) | Self::Removed(p) => p,
        }
    }
}

/// Debounces raw events per path: an event is emitted only after its path
/// stays quiet for the window; newer events supersede older ones.
pub(crate) fn spawn_debouncer(
    mut raw_rx: mpsc::UnboundedReceiver<WatchEvent>,
    out_tx: mpsc::Sender<WatchEvent>,
    window: Duration,
) {
    // Per-path generation; a sleeper only fires if its generation is
    // still current when it wakes.
    let generations: Arc<Mutex<HashMap<PathBuf, (u64, WatchEvent)>>> =
        Arc::new(Mutex::new(HashMap::new()));

    tokio::spawn(async move {
        while let Some(event) = raw_rx.recv().await {
            let path = event.path().to_path_buf();
            let generation = {
                let mut map = generations.lock();
                let entry = map.entry(path.clone()).or_insert((0, event.clone()));
                entry.0 += 1;
                entry.1 = event;
                entry.0
            };

            let generations = generations.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                let ready = {
                    let mut map = generations.lock();
                    match map.get(&path) {
                        Some((current, _)) if *current == generation => map.remove(&path),
                        _ => None,
                    }
                };
                if let Some((_, event)) = ready {
                    let _ = out_tx.send(event).await;
                }
            });
        }
    });
}

/// Watches a plugin directory for `*.opnet` changes.
pub struct PluginDirWatcher {
    // Dropping the watcher stops event delivery.
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for PluginDirWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDirWatcher").finish_non_exhaustive()
    }
}

impl PluginDirWatcher {
    /// Starts watching. Returns the watcher guard and the debounced event
    /// stream.
    pub fn start(
        dir: &Path,
        window: Duration,
    ) -> Result<(Self, mpsc::Receiver<WatchEvent>), PluginError> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(64);
        spawn_debouncer(raw_rx, out_tx, window);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(%e, "fs watch error");
                    return;
                }
            };

            for path in event.paths {
                if path.extension().and_then(|e| e.to_str()) != Some("opnet") {
                    continue;
                }
                let mapped = match event.kind {
                    EventKind::Create(_) => WatchEvent::Added(path),
                    EventKind::Modify(_) => WatchEvent::Modified(path),
                    EventKind::Remove(_) => WatchEvent::Removed(path),
                    _ => continue,
                };
                debug!(?mapped, "raw fs event");
                let _ = raw_tx.send(mapped);
            }
        })
        .map_err(|e| PluginError::Worker(format!("fs watcher: {e}")))?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| PluginError::Worker(format!("fs watch {}: {e}", dir.display())))?;

        Ok((Self { _watcher: watcher }, out_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_latest_event() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        spawn_debouncer(raw_rx, out_tx, Duration::from_millis(100));

        let path = PathBuf::from("demo.opnet");
        raw_tx.send(WatchEvent::Added(path.clone())).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        raw_tx.send(WatchEvent::Modified(path.clone())).unwrap();

        // 100 ms after the *last* event, exactly one fires.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(out_rx.recv().await.unwrap(), WatchEvent::Modified(path));
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_paths_debounce_independently() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        spawn_debouncer(raw_rx, out_tx, Duration::from_millis(100));

        raw_tx.send(WatchEvent::Added("a.opnet".into())).unwrap();
        raw_tx.send(WatchEvent::Removed("b.opnet".into())).unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let first = out_rx.recv().await.unwrap();
        let second = out_rx.recv().await.unwrap();
        let mut got = vec![first, second];
        got.sort_by_key(|e| e.path().to_path_buf());
        assert_eq!(
            got,
            vec![
                WatchEvent::Added("a.opnet".into()),
                WatchEvent::Removed("b.opnet".into())
            ]
        );
    }

    #[tokio::test]
    async fn test_watches_real_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (_watcher, mut events) =
            PluginDirWatcher::start(dir.path(), Duration::from_millis(50)).unwrap();

        let path = dir.path().join("fresh.opnet");
        std::fs::write(&path, b"content").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("watcher produced no event")
            .unwrap();
        assert_eq!(event.path(), path);
    }
}
