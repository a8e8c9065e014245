//! Sync engine - serialized backup-and-replace between paired save trees.
//!
//! Every operation on a pair runs under that pair's lock, so manual,
//! reconcile and watcher-triggered syncs of the same pair never overlap.
//! Filesystem work runs on the blocking pool; outcomes are published on the
//! [`EventBus`].

pub mod echo;
pub mod locks;
pub mod reconcile;
pub mod transfer;

use crate::backup::BackupStore;
use crate::config::{BusyPolicy, SyncConfig};
use crate::events::{EventBus, SyncEvent, Trigger};
use crate::fs::{Fingerprint, Freshness};
use crate::registry::{Direction, PairRegistry, SavePair, Side};
use crate::utils::format::{format_bytes, format_elapsed};
use crate::utils::{Result, SyncError};
use dashmap::DashMap;
use echo::EchoGuard;
use locks::PairLocks;
use reconcile::{decide, Decision};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use transfer::SyncOperation;
use uuid::Uuid;

/// Where a pair is in its reconcile/sync cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PairState {
    Idle,
    Comparing,
    NoopEqual,
    SyncingSrcToDst,
    SyncingDstToSrc,
}

impl PairState {
    fn syncing(direction: Direction) -> Self {
        match direction {
            Direction::SourceToDest => PairState::SyncingSrcToDst,
            Direction::DestToSource => PairState::SyncingDstToSrc,
        }
    }
}

/// A completed sync, as reported to callers and on the event bus
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub id: Uuid,
    pub pair: Option<String>,
    pub direction: Option<Direction>,
    pub trigger: Trigger,
    #[serde(flatten)]
    pub operation: SyncOperation,
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = &self.operation;
        write!(
            f,
            "[{}] synced {} -> {} ({} files, {}, {}); backups: {}, {}",
            self.pair.as_deref().unwrap_or("-"),
            op.source.display(),
            op.dest.display(),
            op.files,
            format_bytes(op.bytes),
            format_elapsed(Duration::from_millis(op.elapsed_ms)),
            op.source_backup.display(),
            op.dest_backup.display()
        )
    }
}

/// Result of reconciling one pair
#[derive(Debug)]
pub enum ReconcileOutcome {
    InSync,
    BothEmpty,
    Synced(SyncReport),
}

/// Per-pair entry returned by [`SyncEngine::auto_reconcile`]
#[derive(Debug)]
pub struct SyncResult {
    pub pair: String,
    pub outcome: Result<ReconcileOutcome>,
}

impl SyncResult {
    pub fn report(&self) -> Option<&SyncReport> {
        match &self.outcome {
            Ok(ReconcileOutcome::Synced(report)) => Some(report),
            _ => None,
        }
    }

    pub fn is_err(&self) -> bool {
        self.outcome.is_err()
    }
}

/// A backup copied back over one side of a pair
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub pair: String,
    pub side: Side,
    pub root: PathBuf,
    pub restored_from: PathBuf,
    /// Snapshot of the tree taken before it was overwritten
    pub safety_backup: PathBuf,
    pub files: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Minimum lead before one side counts as newer
    pub tolerance: Duration,
    pub on_busy: BusyPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            tolerance: Duration::ZERO,
            on_busy: BusyPolicy::Queue,
        }
    }
}

impl From<&SyncConfig> for EngineOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            tolerance: config.tolerance(),
            on_busy: config.on_busy,
        }
    }
}

/// One sync about to run under a held lock
struct Job {
    pair: Option<String>,
    direction: Option<Direction>,
    from: PathBuf,
    to: PathBuf,
    trigger: Trigger,
}

struct EngineInner {
    registry: Arc<PairRegistry>,
    store: BackupStore,
    locks: PairLocks,
    states: DashMap<String, PairState>,
    echo: Arc<EchoGuard>,
    events: EventBus,
    options: EngineOptions,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(registry: Arc<PairRegistry>, store: BackupStore, options: EngineOptions) -> Self {
        let states = registry
            .pairs()
            .iter()
            .map(|p| (p.name.clone(), PairState::Idle))
            .collect();

        Self {
            inner: Arc::new(EngineInner {
                registry,
                store,
                locks: PairLocks::new(),
                states,
                echo: Arc::new(EchoGuard::new()),
                events: EventBus::new(),
                options,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<PairRegistry> {
        &self.inner.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn echo_guard(&self) -> &Arc<EchoGuard> {
        &self.inner.echo
    }

    pub fn backups(&self) -> &BackupStore {
        &self.inner.store
    }

    pub fn options(&self) -> EngineOptions {
        self.inner.options
    }

    pub fn pair_state(&self, name: &str) -> Option<PairState> {
        self.inner.states.get(name).map(|s| *s)
    }

    fn set_state(&self, pair: Option<&str>, state: PairState) {
        if let Some(name) = pair {
            self.inner.states.insert(name.to_string(), state);
        }
    }

    /// Back up both trees and replace `dst` with `src`.
    ///
    /// When the paths belong to a registered pair the pair's lock is used;
    /// otherwise the lock is keyed by the destination path.
    pub async fn sync_one_way(&self, src: &Path, dst: &Path) -> Result<SyncReport> {
        let (key, job) = match self.inner.registry.find_by_paths(src, dst) {
            Some(pair) => {
                let direction = if pair.source_path == src {
                    Direction::SourceToDest
                } else {
                    Direction::DestToSource
                };
                (pair.name.clone(), self.job_for(pair, direction, Trigger::Manual))
            }
            None => (
                format!("path:{}", dst.display()),
                Job {
                    pair: None,
                    direction: None,
                    from: src.to_path_buf(),
                    to: dst.to_path_buf(),
                    trigger: Trigger::Manual,
                },
            ),
        };

        let _guard = self.inner.locks.acquire(&key, self.inner.options.on_busy).await?;
        self.execute(job).await
    }

    /// Sync a registered pair in `direction`, honoring the busy policy.
    pub async fn sync_pair(
        &self,
        pair: &SavePair,
        direction: Direction,
        trigger: Trigger,
    ) -> Result<SyncReport> {
        let _guard = self
            .inner
            .locks
            .acquire(&pair.name, self.inner.options.on_busy)
            .await?;
        self.execute(self.job_for(pair, direction, trigger)).await
    }

    /// Watcher entry point: sync from `side` unless that root is still as
    /// the engine last left it.
    ///
    /// Always queues behind a running sync of the pair. Returns `None` for
    /// echoes of the engine's own writes and for roots that became empty.
    pub async fn sync_if_changed(&self, pair: &SavePair, side: Side) -> Result<Option<SyncReport>> {
        let _guard = self.inner.locks.acquire(&pair.name, BusyPolicy::Queue).await?;

        let root = pair.path(side).to_path_buf();
        let current = {
            let root = root.clone();
            run_blocking(move || Fingerprint::of(&root)).await?
        };

        if self.inner.echo.matches(&root, &current) {
            debug!(pair = %pair.name, root = %root.display(), "Ignoring echo of own sync");
            return Ok(None);
        }
        if current.is_empty() {
            warn!(
                pair = %pair.name,
                root = %root.display(),
                "Watched root has no files, not propagating"
            );
            return Ok(None);
        }

        let direction = Direction::from_side(side);
        self.execute(self.job_for(pair, direction, Trigger::Watcher))
            .await
            .map(Some)
    }

    /// Compare both sides of `pair` and sync from the newer one.
    pub async fn reconcile_pair(&self, pair: &SavePair) -> Result<ReconcileOutcome> {
        let _guard = self.inner.locks.acquire(&pair.name, BusyPolicy::Queue).await?;
        let name = pair.name.as_str();

        self.set_state(Some(name), PairState::Comparing);
        let freshness = {
            let source = pair.source_path.clone();
            let dest = pair.dest_path.clone();
            run_blocking(move || Ok((Freshness::of(&source)?, Freshness::of(&dest)?))).await
        };
        let (source, dest) = match freshness {
            Ok(pair_freshness) => pair_freshness,
            Err(e) => {
                warn!(pair = %name, "Reconcile could not compare sides: {}", e);
                self.set_state(Some(name), PairState::Idle);
                return Err(e);
            }
        };

        let decision = decide(source, dest, self.inner.options.tolerance);
        debug!(pair = %name, ?source, ?dest, ?decision, "Reconcile decision");

        match decision {
            Decision::InSync | Decision::BothEmpty => {
                self.set_state(Some(name), PairState::NoopEqual);
                self.remember_pair(pair).await;

                let both_empty = decision == Decision::BothEmpty;
                info!(pair = %name, both_empty, "Pair already in sync");
                self.inner.events.publish(SyncEvent::InSync {
                    pair: name.to_string(),
                    both_empty,
                });
                self.set_state(Some(name), PairState::Idle);

                Ok(if both_empty {
                    ReconcileOutcome::BothEmpty
                } else {
                    ReconcileOutcome::InSync
                })
            }
            Decision::Sync(direction) => {
                let job = self.job_for(pair, direction, Trigger::Reconcile);
                self.execute(job).await.map(ReconcileOutcome::Synced)
            }
        }
    }

    /// Reconcile every pair concurrently; results keep the input order.
    pub async fn auto_reconcile(&self, pairs: &[SavePair]) -> Vec<SyncResult> {
        let handles: Vec<_> = pairs
            .iter()
            .cloned()
            .map(|pair| {
                let engine = self.clone();
                let name = pair.name.clone();
                let handle = tokio::spawn(async move { engine.reconcile_pair(&pair).await });
                (name, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (pair, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(pair = %pair, "Reconcile task failed: {}", e);
                    Err(SyncError::Io(std::io::Error::other(e)))
                }
            };
            results.push(SyncResult { pair, outcome });
        }
        results
    }

    pub async fn reconcile_all(&self) -> Vec<SyncResult> {
        let registry = Arc::clone(&self.inner.registry);
        self.auto_reconcile(registry.pairs()).await
    }

    /// Copy `backup` over one side of `pair`, snapshotting that side first.
    pub async fn restore_backup(
        &self,
        pair: &SavePair,
        side: Side,
        backup: &Path,
    ) -> Result<RestoreReport> {
        let _guard = self
            .inner
            .locks
            .acquire(&pair.name, self.inner.options.on_busy)
            .await?;

        let root = pair.path(side).to_path_buf();
        if !backup.is_dir() {
            return Err(SyncError::SourceMissing(backup.to_path_buf()));
        }

        self.inner.echo.begin(&root);
        let result = {
            let store = self.inner.store.clone();
            let root = root.clone();
            let backup = backup.to_path_buf();
            run_blocking(move || {
                let safety = store.backup(&root)?;
                let stats = store.restore(&backup, &root)?;
                Ok((safety, stats))
            })
            .await
        };
        self.inner.echo.finish(&root);

        let (safety_backup, stats) = match result {
            Ok(restored) => restored,
            Err(e) => {
                error!(
                    pair = %pair.name,
                    root = %root.display(),
                    backup = %backup.display(),
                    kind = e.kind(),
                    "Restore failed: {}", e
                );
                self.inner.events.publish(SyncEvent::RestoreFailed {
                    pair: pair.name.clone(),
                    root,
                    kind: e.kind().to_string(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };
        self.remember_pair(pair).await;
        info!(
            pair = %pair.name,
            root = %root.display(),
            backup = %backup.display(),
            files = stats.files,
            "Backup restored"
        );

        let report = RestoreReport {
            pair: pair.name.clone(),
            side,
            root,
            restored_from: backup.to_path_buf(),
            safety_backup,
            files: stats.files,
            bytes: stats.bytes,
        };
        self.inner
            .events
            .publish(SyncEvent::RestoreCompleted(report.clone()));
        Ok(report)
    }

    fn job_for(&self, pair: &SavePair, direction: Direction, trigger: Trigger) -> Job {
        let (from, to) = pair.endpoints(direction);
        Job {
            pair: Some(pair.name.clone()),
            direction: Some(direction),
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            trigger,
        }
    }

    /// Record both sides' current fingerprints as engine-produced state.
    async fn remember_pair(&self, pair: &SavePair) {
        for side in [Side::Source, Side::Dest] {
            let root = pair.path(side).to_path_buf();
            let scanned = {
                let root = root.clone();
                run_blocking(move || Fingerprint::of(&root)).await
            };
            match scanned {
                Ok(fingerprint) => self.inner.echo.record(&root, fingerprint),
                Err(e) => {
                    debug!(root = %root.display(), "Could not fingerprint root: {}", e);
                    self.inner.echo.forget(&root);
                }
            }
        }
    }

    /// Run a sync. The caller holds the pair lock.
    async fn execute(&self, job: Job) -> Result<SyncReport> {
        let id = Uuid::new_v4();
        let pair = job.pair.as_deref();

        if let Some(direction) = job.direction {
            self.set_state(pair, PairState::syncing(direction));
        }
        info!(
            %id,
            pair = pair.unwrap_or("-"),
            trigger = %job.trigger,
            source = %job.from.display(),
            dest = %job.to.display(),
            "Starting sync"
        );
        self.inner.events.publish(SyncEvent::SyncStarted {
            id,
            pair: job.pair.clone(),
            trigger: job.trigger,
            source: job.from.clone(),
            dest: job.to.clone(),
        });

        self.inner.echo.begin(&job.to);
        let result = {
            let store = self.inner.store.clone();
            let from = job.from.clone();
            let to = job.to.clone();
            run_blocking(move || {
                // Taken before the copy so edits landing mid-sync still differ
                let from_marker = Fingerprint::of(&from).ok();
                let operation = transfer::sync_one_way(&store, &from, &to)?;
                Ok((operation, (from_marker, Fingerprint::of(&to).ok())))
            })
            .await
        };
        self.inner.echo.finish(&job.to);

        let outcome = match result {
            Ok((operation, (from_marker, to_marker))) => {
                for (root, marker) in [(&job.from, from_marker), (&job.to, to_marker)] {
                    match marker {
                        Some(fingerprint) => self.inner.echo.record(root, fingerprint),
                        None => self.inner.echo.forget(root),
                    }
                }

                let report = SyncReport {
                    id,
                    pair: job.pair.clone(),
                    direction: job.direction,
                    trigger: job.trigger,
                    operation,
                };
                self.inner
                    .events
                    .publish(SyncEvent::SyncCompleted(report.clone()));
                Ok(report)
            }
            Err(e) => {
                error!(
                    %id,
                    pair = pair.unwrap_or("-"),
                    kind = e.kind(),
                    source = %job.from.display(),
                    dest = %job.to.display(),
                    "Sync failed: {}", e
                );
                self.inner.events.publish(SyncEvent::SyncFailed {
                    id,
                    pair: job.pair.clone(),
                    trigger: job.trigger,
                    source: job.from.clone(),
                    dest: job.to.clone(),
                    kind: e.kind().to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        };

        self.set_state(pair, PairState::Idle);
        outcome
    }
}

/// Run blocking filesystem work off the async workers.
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(e)))?
}
