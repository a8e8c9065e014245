//! Suppression of watcher events caused by the engine's own writes.
//!
//! Two mechanisms work together. While a sync is writing into a tree, that
//! tree is muted and the watcher drops its events outright. After the sync,
//! the engine records a fingerprint of both trees; a later debounced change
//! whose fingerprint still matches is an echo of that write, not a user edit.

use crate::fs::Fingerprint;
use dashmap::DashMap;
use std::path::{Path, PathBuf};

#[derive(Default)]
pub struct EchoGuard {
    in_flight: DashMap<PathBuf, usize>,
    markers: DashMap<PathBuf, Fingerprint>,
}

impl EchoGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mute `root` until the matching [`finish`](Self::finish).
    pub fn begin(&self, root: &Path) {
        *self.in_flight.entry(root.to_path_buf()).or_insert(0) += 1;
    }

    pub fn finish(&self, root: &Path) {
        let done = match self.in_flight.get_mut(root) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if done {
            self.in_flight.remove_if(root, |_, count| *count == 0);
        }
    }

    pub fn is_muted(&self, root: &Path) -> bool {
        self.in_flight.get(root).map(|c| *c > 0).unwrap_or(false)
    }

    /// Remember the state the engine left `root` in.
    pub fn record(&self, root: &Path, fingerprint: Fingerprint) {
        self.markers.insert(root.to_path_buf(), fingerprint);
    }

    pub fn forget(&self, root: &Path) {
        self.markers.remove(root);
    }

    /// True if `root` is still exactly as the engine left it.
    pub fn matches(&self, root: &Path, current: &Fingerprint) -> bool {
        self.markers
            .get(root)
            .map(|marker| *marker == *current)
            .unwrap_or(false)
    }
}
