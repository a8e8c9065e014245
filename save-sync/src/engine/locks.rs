//! One in-flight sync per pair.

use crate::config::BusyPolicy;
use crate::utils::{Result, SyncError};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Async mutexes keyed by pair name, created on first use
#[derive(Default)]
pub struct PairLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PairLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Take the lock for `key`. `Queue` waits; `FailFast` returns
    /// `AlreadySyncing` if another sync holds it.
    pub async fn acquire(&self, key: &str, policy: BusyPolicy) -> Result<OwnedMutexGuard<()>> {
        let lock = self.lock_for(key);
        match policy {
            BusyPolicy::Queue => Ok(lock.lock_owned().await),
            BusyPolicy::FailFast => lock
                .try_lock_owned()
                .map_err(|_| SyncError::AlreadySyncing(key.to_string())),
        }
    }

    pub fn is_busy(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}
