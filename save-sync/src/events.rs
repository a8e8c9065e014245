//! Engine event bus.
//!
//! Every sync outcome is published here. The controller forwards events to
//! the presentation layer; the watcher listens for syncs and restores to
//! re-arm watches on replaced directories.

use crate::engine::{RestoreReport, SyncReport};
use crate::registry::Direction;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Maximum number of queued events per subscriber
const BROADCAST_CAPACITY: usize = 256;

/// What started a sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Manual,
    Reconcile,
    Watcher,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Manual => f.write_str("manual"),
            Trigger::Reconcile => f.write_str("reconcile"),
            Trigger::Watcher => f.write_str("watcher"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum SyncEvent {
    #[serde(rename = "sync:started")]
    SyncStarted {
        id: Uuid,
        pair: Option<String>,
        trigger: Trigger,
        source: PathBuf,
        dest: PathBuf,
    },

    #[serde(rename = "sync:completed")]
    SyncCompleted(SyncReport),

    #[serde(rename = "sync:failed")]
    SyncFailed {
        id: Uuid,
        pair: Option<String>,
        trigger: Trigger,
        source: PathBuf,
        dest: PathBuf,
        kind: String,
        error: String,
    },

    /// The user declined a manual sync at the confirmation step
    #[serde(rename = "sync:declined")]
    SyncDeclined { pair: String, direction: Direction },

    #[serde(rename = "reconcile:in-sync")]
    InSync { pair: String, both_empty: bool },

    #[serde(rename = "restore:completed")]
    RestoreCompleted(RestoreReport),

    #[serde(rename = "restore:failed")]
    RestoreFailed {
        pair: String,
        root: PathBuf,
        kind: String,
        error: String,
    },

    #[serde(rename = "watch:failed")]
    WatchFailed { root: PathBuf, error: String },
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncEvent::SyncStarted { pair, source, dest, .. } => write!(
                f,
                "[{}] syncing {} -> {}",
                pair.as_deref().unwrap_or("-"),
                source.display(),
                dest.display()
            ),
            SyncEvent::SyncCompleted(report) => write!(f, "{}", report),
            SyncEvent::SyncFailed { pair, source, dest, error, .. } => write!(
                f,
                "[{}] sync {} -> {} failed: {}",
                pair.as_deref().unwrap_or("-"),
                source.display(),
                dest.display(),
                error
            ),
            SyncEvent::SyncDeclined { pair, direction } => {
                write!(f, "[{}] sync {} cancelled", pair, direction)
            }
            SyncEvent::InSync { pair, both_empty: true } => {
                write!(f, "[{}] both sides empty, nothing to do", pair)
            }
            SyncEvent::InSync { pair, both_empty: false } => write!(f, "[{}] already in sync", pair),
            SyncEvent::RestoreCompleted(report) => write!(
                f,
                "[{}] restored {} from {}",
                report.pair,
                report.root.display(),
                report.restored_from.display()
            ),
            SyncEvent::RestoreFailed { pair, root, error, .. } => {
                write!(f, "[{}] restoring {} failed: {}", pair, root.display(), error)
            }
            SyncEvent::WatchFailed { root, error } => {
                write!(f, "not watching {}: {}", root.display(), error)
            }
        }
    }
}

/// Broadcast channel carrying [`SyncEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
