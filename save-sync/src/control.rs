//! Command channel between a presentation layer and the engine.
//!
//! The frontend talks to a controller task through [`ControllerHandle`];
//! each command carries a oneshot for its reply. Engine events flow back to
//! the frontend's [`Frontend::notify`] from a separate forwarding task.

use crate::config::{Config, LabelConfig};
use crate::engine::{SyncEngine, SyncReport, SyncResult};
use crate::events::{SyncEvent, Trigger};
use crate::registry::{Direction, SavePair, Side};
use crate::utils::{Result, SyncError};
use crate::watcher::{ChangeWatcher, WatchOptions, WatcherHandle};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Queued commands before senders wait
const COMMAND_CAPACITY: usize = 32;

/// Callbacks the engine makes into the presentation layer.
///
/// `confirm` may block (it runs on the blocking pool). `notify` is called
/// from the event forwarder and should return quickly.
pub trait Frontend: Send + Sync + 'static {
    fn confirm(&self, message: &str) -> bool;
    fn notify(&self, event: &SyncEvent);
}

#[derive(Debug)]
pub enum ManualOutcome {
    Completed(SyncReport),
    Declined,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub labels: LabelConfig,
    pub watch: WatchOptions,
    /// Reconcile every pair when auto mode starts
    pub reconcile_on_start: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            labels: LabelConfig::default(),
            watch: WatchOptions::default(),
            reconcile_on_start: true,
        }
    }
}

impl From<&Config> for ControllerSettings {
    fn from(config: &Config) -> Self {
        Self {
            labels: config.labels.clone(),
            watch: WatchOptions::from(&config.watch),
            reconcile_on_start: config.watch.reconcile_on_start,
        }
    }
}

enum Command {
    ManualSync {
        index: usize,
        direction: Direction,
        reply: oneshot::Sender<Result<ManualOutcome>>,
    },
    StartAutoReconcile {
        reply: oneshot::Sender<Result<Vec<SyncResult>>>,
    },
    StopAutoReconcile {
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable entry point for frontends
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Command>,
}

impl ControllerHandle {
    /// Confirm with the user, then sync pair `index` in `direction`.
    pub async fn manual_sync(&self, index: usize, direction: Direction) -> Result<ManualOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ManualSync {
            index,
            direction,
            reply,
        })
        .await?;
        rx.await.map_err(|_| SyncError::EngineStopped)?
    }

    /// Start watching all pairs. Returns the initial reconcile results
    /// (empty when auto mode was already on or initial reconcile is off).
    pub async fn start_auto_reconcile(&self) -> Result<Vec<SyncResult>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StartAutoReconcile { reply }).await?;
        rx.await.map_err(|_| SyncError::EngineStopped)?
    }

    /// Stop watching. Returns false if auto mode was not on.
    pub async fn stop_auto_reconcile(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StopAutoReconcile { reply }).await?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| SyncError::EngineStopped)
    }
}

pub struct Controller {
    engine: SyncEngine,
    frontend: Arc<dyn Frontend>,
    settings: ControllerSettings,
    watcher: Option<WatcherHandle>,
}

impl Controller {
    /// Spawn the controller and its event forwarder. Both end once every
    /// [`ControllerHandle`] is dropped.
    pub fn spawn(
        engine: SyncEngine,
        frontend: Arc<dyn Frontend>,
        settings: ControllerSettings,
    ) -> (ControllerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let done = CancellationToken::new();

        tokio::spawn(forward_events(
            engine.events().subscribe(),
            Arc::clone(&frontend),
            done.clone(),
        ));

        let controller = Controller {
            engine,
            frontend,
            settings,
            watcher: None,
        };
        let task = tokio::spawn(controller.run(rx, done));
        (ControllerHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>, done: CancellationToken) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::ManualSync {
                    index,
                    direction,
                    reply,
                } => self.manual_sync(index, direction, reply),
                Command::StartAutoReconcile { reply } => {
                    let _ = reply.send(self.start_auto().await);
                }
                Command::StopAutoReconcile { reply } => {
                    let _ = reply.send(self.stop_auto().await);
                }
            }
        }

        self.stop_auto().await;
        done.cancel();
        debug!("Controller stopped");
    }

    fn manual_sync(
        &self,
        index: usize,
        direction: Direction,
        reply: oneshot::Sender<Result<ManualOutcome>>,
    ) {
        let Some(pair) = self.engine.registry().get(index).cloned() else {
            let _ = reply.send(Err(SyncError::UnknownPair(index.to_string())));
            return;
        };

        let message = confirmation_message(&pair, direction, &self.settings.labels);
        let engine = self.engine.clone();
        let frontend = Arc::clone(&self.frontend);

        // Runs detached so the controller keeps serving commands while the
        // user decides; the pair lock is taken only after confirmation.
        tokio::spawn(async move {
            let confirmed = tokio::task::spawn_blocking(move || frontend.confirm(&message))
                .await
                .unwrap_or(false);

            let outcome = if confirmed {
                engine
                    .sync_pair(&pair, direction, Trigger::Manual)
                    .await
                    .map(ManualOutcome::Completed)
            } else {
                info!(pair = %pair.name, %direction, "Manual sync declined");
                engine.events().publish(SyncEvent::SyncDeclined {
                    pair: pair.name.clone(),
                    direction,
                });
                Ok(ManualOutcome::Declined)
            };
            let _ = reply.send(outcome);
        });
    }

    async fn start_auto(&mut self) -> Result<Vec<SyncResult>> {
        if self.watcher.is_some() {
            debug!("Auto reconcile already running");
            return Ok(Vec::new());
        }

        // Watch first so edits made during the initial pass are not missed
        let handle = ChangeWatcher::start(self.engine.clone(), self.settings.watch)?;
        self.watcher = Some(handle);

        if !self.settings.reconcile_on_start {
            return Ok(Vec::new());
        }
        let results = self.engine.reconcile_all().await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(pairs = results.len(), failed, "Initial reconcile finished");
        Ok(results)
    }

    async fn stop_auto(&mut self) -> bool {
        match self.watcher.take() {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }
}

/// "Overwrite the ryujinx save of Zelda with the yuzu save?" plus paths.
pub fn confirmation_message(pair: &SavePair, direction: Direction, labels: &LabelConfig) -> String {
    let label = |side: Side| match side {
        Side::Source => labels.source.as_str(),
        Side::Dest => labels.dest.as_str(),
    };
    let from = direction.origin();
    let (from_path, to_path) = pair.endpoints(direction);

    format!(
        "Overwrite the {} save of '{}' with the {} save?\n  {} -> {}\nBoth directories are backed up first.",
        label(from.other()),
        pair.name,
        label(from),
        from_path.display(),
        to_path.display()
    )
}

async fn forward_events(
    mut rx: broadcast::Receiver<SyncEvent>,
    frontend: Arc<dyn Frontend>,
    done: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            event = rx.recv() => match event {
                Ok(event) => frontend.notify(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Notification forwarder lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
