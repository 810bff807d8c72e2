//! Named async mutexes keyed by workflow uid or deployment id.
//!
//! Monitor loops, heartbeat handlers and on-demand operations take the lock of
//! the key they touch. The usual pattern is read a snapshot, release, make the
//! remote call, then re-acquire and commit after re-checking the version.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct LockGroup {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LockGroup {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Wait for the lock of `key`
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        self.entry(key).lock_owned().await
    }

    /// Take the lock of `key` only if nobody holds it
    pub fn try_lock(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        self.entry(key).try_lock_owned().ok()
    }

    /// Drop locks nobody holds or waits for
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
