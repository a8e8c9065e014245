//! Filesystem watcher driving syncs from debounced changes.
//!
//! A single dispatcher task multiplexes raw `notify` events, per-root
//! debounce deadlines and engine events. When a root has been quiet for the
//! debounce window, the dispatcher asks the engine to sync from that root to
//! its counterpart; the engine itself decides whether the change is an echo
//! of its own write.
//!
//! Replacing a root swaps its inode, which silently ends an inotify watch.
//! Roots are re-subscribed after every engine sync or restore into them,
//! after a bus lag (missed events could have named any root), and when the
//! root directory itself is reported moved or removed.

use crate::config::WatchConfig;
use crate::engine::SyncEngine;
use crate::events::SyncEvent;
use crate::registry::Side;
use crate::utils::{Result, SyncError};
use notify::event::{MetadataKind, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    /// Quiet window before a root's changes trigger a sync
    pub debounce: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
        }
    }
}

impl From<&WatchConfig> for WatchOptions {
    fn from(config: &WatchConfig) -> Self {
        Self {
            debounce: config.debounce(),
        }
    }
}

/// One side of one pair under watch
#[derive(Debug, Clone)]
struct WatchedRoot {
    pair: usize,
    side: Side,
    /// Path as configured; the engine keys locks and markers by it
    configured: PathBuf,
    /// Absolute path handed to `notify` and matched against event paths
    normalized: PathBuf,
}

/// A root that could not be subscribed
#[derive(Debug, Clone)]
pub struct FailedRoot {
    pub path: PathBuf,
    pub error: String,
}

pub struct ChangeWatcher;

impl ChangeWatcher {
    /// Subscribe every pair root and start the dispatcher.
    ///
    /// A root that cannot be watched is logged, reported on the event bus
    /// and left out; the remaining roots are still watched.
    pub fn start(engine: SyncEngine, options: WatchOptions) -> Result<WatcherHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })
        .map_err(|e| SyncError::WatchSubscription {
            path: PathBuf::new(),
            source: e,
        })?;

        let mut roots = Vec::new();
        let mut failed = Vec::new();
        for (index, pair) in engine.registry().pairs().iter().enumerate() {
            for side in [Side::Source, Side::Dest] {
                let configured = pair.path(side).to_path_buf();
                let normalized = normalize_root(&configured);

                match watcher.watch(&normalized, RecursiveMode::Recursive) {
                    Ok(()) => {
                        debug!(pair = %pair.name, root = %normalized.display(), "Watching root");
                        roots.push(WatchedRoot {
                            pair: index,
                            side,
                            configured,
                            normalized,
                        });
                    }
                    Err(e) => {
                        let err = SyncError::WatchSubscription {
                            path: configured.clone(),
                            source: e,
                        };
                        warn!(pair = %pair.name, "{}", err);
                        engine.events().publish(SyncEvent::WatchFailed {
                            root: configured.clone(),
                            error: err.to_string(),
                        });
                        failed.push(FailedRoot {
                            path: configured,
                            error: err.to_string(),
                        });
                    }
                }
            }
        }

        info!(
            watched = roots.len(),
            failed = failed.len(),
            debounce_ms = options.debounce.as_millis() as u64,
            "Change watcher started"
        );

        let watched = roots.iter().map(|r| r.configured.clone()).collect();
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher {
            bus: engine.events().subscribe(),
            engine,
            watcher,
            roots,
            pending: HashMap::new(),
            stale: HashSet::new(),
            tasks: JoinSet::new(),
            debounce: options.debounce,
        };
        let task = tokio::spawn(dispatcher.run(rx, cancel.clone()));

        Ok(WatcherHandle {
            cancel,
            task: Some(task),
            watched,
            failed,
        })
    }
}

/// Running watcher. Dropping it stops the dispatcher without waiting.
pub struct WatcherHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    watched: Vec<PathBuf>,
    failed: Vec<FailedRoot>,
}

impl WatcherHandle {
    pub fn watched_roots(&self) -> &[PathBuf] {
        &self.watched
    }

    pub fn failed_roots(&self) -> &[FailedRoot] {
        &self.failed
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Stop watching and wait for syncs already started to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Watcher dispatcher ended abnormally: {}", e);
            }
        }
        info!("Change watcher stopped");
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Dispatcher {
    engine: SyncEngine,
    watcher: RecommendedWatcher,
    bus: broadcast::Receiver<SyncEvent>,
    roots: Vec<WatchedRoot>,
    /// Root index -> instant its debounce window closes
    pending: HashMap<usize, Instant>,
    /// Roots seen moved or removed, re-subscribed before their next sync
    stale: HashSet<usize>,
    tasks: JoinSet<()>,
    debounce: Duration,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
        cancel: CancellationToken,
    ) {
        loop {
            let deadline = self.pending.values().min().copied();

            tokio::select! {
                _ = cancel.cancelled() => break,

                Some(res) = rx.recv() => self.on_fs_event(res),

                received = self.bus.recv() => {
                    if matches!(received, Err(RecvError::Closed)) {
                        break;
                    }
                    if let Err(RecvError::Lagged(n)) = received {
                        warn!("Watcher lagged by {} engine events, re-arming every root", n);
                    }
                    for index in swapped_roots(&self.roots, &received) {
                        self.rearm(index);
                    }
                }

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.fire_due();
                }

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Watcher sync task failed: {}", e);
                    }
                }
            }
        }

        // Syncs already past the lock run to completion
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Watcher sync task failed: {}", e);
            }
        }
    }

    fn on_fs_event(&mut self, res: notify::Result<Event>) {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                warn!("Watch error: {}", e);
                return;
            }
        };
        if !is_relevant(&event.kind) {
            return;
        }

        let now = Instant::now();
        for path in &event.paths {
            for index in match_roots(&self.roots, path) {
                let root = &self.roots[index];
                if replaces_root(&event.kind) && *path == root.normalized {
                    debug!(root = %root.configured.display(), "Root directory moved or removed");
                    self.stale.insert(index);
                }
                if self.engine.echo_guard().is_muted(&root.configured) {
                    trace!(root = %root.configured.display(), path = %path.display(), "Muted during sync");
                    continue;
                }
                trace!(root = %root.configured.display(), path = %path.display(), "Change detected");
                self.pending.insert(index, now + self.debounce);
            }
        }
    }

    fn fire_due(&mut self) {
        let now = Instant::now();
        let due: Vec<usize> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(index, _)| *index)
            .collect();

        for index in due {
            self.pending.remove(&index);
            if self.stale.contains(&index) {
                self.rearm(index);
            }
            let root = &self.roots[index];
            let Some(pair) = self.engine.registry().get(root.pair).cloned() else {
                continue;
            };
            let side = root.side;
            let engine = self.engine.clone();

            debug!(pair = %pair.name, root = %root.configured.display(), "Changes settled");
            self.tasks.spawn(async move {
                match engine.sync_if_changed(&pair, side).await {
                    Ok(Some(report)) => info!(pair = %pair.name, "Auto-sync: {}", report),
                    Ok(None) => {}
                    Err(e) => warn!(pair = %pair.name, kind = e.kind(), "Auto-sync failed: {}", e),
                }
            });
        }
    }

    /// Re-subscribe a root whose directory may have been swapped out.
    fn rearm(&mut self, index: usize) {
        let root = &self.roots[index];
        let _ = self.watcher.unwatch(&root.normalized);
        match self.watcher.watch(&root.normalized, RecursiveMode::Recursive) {
            Ok(()) => {
                trace!(root = %root.normalized.display(), "Watch re-armed");
                self.stale.remove(&index);
            }
            Err(e) => {
                warn!(root = %root.normalized.display(), "Failed to re-arm watch: {}", e);
                self.stale.insert(index);
            }
        }
    }
}

/// Roots an engine event says were replaced. A lag means events were
/// dropped, so every root is returned.
fn swapped_roots(
    roots: &[WatchedRoot],
    received: &std::result::Result<SyncEvent, RecvError>,
) -> Vec<usize> {
    let replaced = match received {
        Ok(SyncEvent::SyncCompleted(report)) => &report.operation.dest,
        Ok(SyncEvent::SyncFailed { dest, .. }) => dest,
        Ok(SyncEvent::RestoreCompleted(report)) => &report.root,
        Ok(SyncEvent::RestoreFailed { root, .. }) => root,
        Ok(_) | Err(RecvError::Closed) => return Vec::new(),
        Err(RecvError::Lagged(_)) => return (0..roots.len()).collect(),
    };
    roots
        .iter()
        .enumerate()
        .filter(|(_, root)| root.configured == *replaced)
        .map(|(index, _)| index)
        .collect()
}

/// Absolute, symlink-resolved form of a root; falls back to joining the
/// working directory when the root cannot be resolved.
fn normalize_root(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Whether an event kind can change a tree's contents.
fn is_relevant(kind: &EventKind) -> bool {
    match kind {
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime)) => false,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any => true,
        _ => false,
    }
}

/// Whether an event on a root's own path means the directory went away.
fn replaces_root(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)))
}

/// Indices of roots containing `path`, compared component-wise so that
/// `/save/zelda_1700000000` does not match `/save/zelda`.
fn match_roots(roots: &[WatchedRoot], path: &Path) -> Vec<usize> {
    roots
        .iter()
        .enumerate()
        .filter(|(_, root)| path.starts_with(&root.normalized))
        .map(|(index, _)| index)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Trigger;
    use notify::event::{AccessKind, CreateKind, DataChange, RemoveKind, RenameMode};
    use uuid::Uuid;

    fn root(pair: usize, side: Side, path: &str) -> WatchedRoot {
        WatchedRoot {
            pair,
            side,
            configured: PathBuf::from(path),
            normalized: PathBuf::from(path),
        }
    }

    #[test]
    fn test_relevant_kinds() {
        assert!(is_relevant(&EventKind::Create(CreateKind::File)));
        assert!(is_relevant(&EventKind::Modify(ModifyKind::Data(DataChange::Content))));
        assert!(is_relevant(&EventKind::Remove(RemoveKind::Folder)));
        assert!(is_relevant(&EventKind::Any));

        assert!(!is_relevant(&EventKind::Access(AccessKind::Read)));
        assert!(!is_relevant(&EventKind::Modify(ModifyKind::Metadata(
            MetadataKind::AccessTime
        ))));
        assert!(!is_relevant(&EventKind::Other));
    }

    #[test]
    fn test_match_is_component_wise() {
        let roots = vec![
            root(0, Side::Source, "/save/yuzu/zelda"),
            root(0, Side::Dest, "/save/ryujinx/zelda"),
        ];

        assert_eq!(match_roots(&roots, Path::new("/save/yuzu/zelda/slot/a.sav")), vec![0]);
        assert_eq!(match_roots(&roots, Path::new("/save/ryujinx/zelda")), vec![1]);
        assert!(match_roots(&roots, Path::new("/save/yuzu/zelda_1700000000/a.sav")).is_empty());
        assert!(match_roots(&roots, Path::new("/save/yuzu/.zelda.incoming-1/a.sav")).is_empty());
    }

    #[test]
    fn test_nested_roots_both_match() {
        let roots = vec![
            root(0, Side::Source, "/save/yuzu"),
            root(1, Side::Source, "/save/yuzu/zelda"),
        ];
        assert_eq!(match_roots(&roots, Path::new("/save/yuzu/zelda/a.sav")), vec![0, 1]);
    }

    #[test]
    fn test_root_replacement_kinds() {
        assert!(replaces_root(&EventKind::Remove(RemoveKind::Folder)));
        assert!(replaces_root(&EventKind::Modify(ModifyKind::Name(RenameMode::From))));
        assert!(!replaces_root(&EventKind::Modify(ModifyKind::Data(DataChange::Content))));
        assert!(!replaces_root(&EventKind::Create(CreateKind::Folder)));
    }

    #[test]
    fn test_swapped_roots_follow_engine_events() {
        let roots = vec![
            root(0, Side::Source, "/save/yuzu/zelda"),
            root(0, Side::Dest, "/save/ryujinx/zelda"),
            root(1, Side::Source, "/save/yuzu/mario"),
        ];

        let failed = SyncEvent::SyncFailed {
            id: Uuid::nil(),
            pair: Some("Zelda".to_string()),
            trigger: Trigger::Watcher,
            source: PathBuf::from("/save/yuzu/zelda"),
            dest: PathBuf::from("/save/ryujinx/zelda"),
            kind: "replace-failed".to_string(),
            error: "denied".to_string(),
        };
        assert_eq!(swapped_roots(&roots, &Ok(failed)), vec![1]);

        let restore_failed = SyncEvent::RestoreFailed {
            pair: "Mario".to_string(),
            root: PathBuf::from("/save/yuzu/mario"),
            kind: "io".to_string(),
            error: "denied".to_string(),
        };
        assert_eq!(swapped_roots(&roots, &Ok(restore_failed)), vec![2]);

        let in_sync = SyncEvent::InSync {
            pair: "Zelda".to_string(),
            both_empty: false,
        };
        assert!(swapped_roots(&roots, &Ok(in_sync)).is_empty());
        assert!(swapped_roots(&roots, &Err(RecvError::Closed)).is_empty());
    }

    #[test]
    fn test_lag_rearms_every_root() {
        let roots = vec![
            root(0, Side::Source, "/save/yuzu/zelda"),
            root(0, Side::Dest, "/save/ryujinx/zelda"),
        ];
        assert_eq!(swapped_roots(&roots, &Err(RecvError::Lagged(12))), vec![0, 1]);
    }

    #[test]
    fn test_normalize_relative_root() {
        let normalized = normalize_root(Path::new("does-not-exist/zelda"));
        assert!(normalized.is_absolute());
        assert!(normalized.ends_with("does-not-exist/zelda"));
    }
}
