//! Per-uid unpacking locks
//!
//! At most one worker unpacks a given uid at a time, and the analysis
//! scheduler probes [`UnpackingLockManager::is_locked`] so it never dispatches
//! plugins against a half-extracted object. One manager is shared by handle
//! between every scheduler and worker of a pipeline.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct LockEntry {
    held: bool,
    waiters: usize,
}

#[derive(Debug, Default)]
pub struct UnpackingLockManager {
    table: Mutex<HashMap<String, LockEntry>>,
    released: Condvar,
}

impl UnpackingLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock for `uid` is ours
    pub fn acquire(&self, uid: &str) {
        let mut table = self.table.lock();
        loop {
            let entry = table.entry(uid.to_string()).or_default();
            if !entry.held {
                entry.held = true;
                return;
            }
            entry.waiters += 1;
            self.released.wait(&mut table);
            if let Some(entry) = table.get_mut(uid) {
                entry.waiters -= 1;
            }
        }
    }

    /// Non-blocking variant of [`acquire`](Self::acquire)
    pub fn try_acquire(&self, uid: &str) -> bool {
        let mut table = self.table.lock();
        let entry = table.entry(uid.to_string()).or_default();
        if entry.held {
            return false;
        }
        entry.held = true;
        true
    }

    pub fn release(&self, uid: &str) {
        let mut table = self.table.lock();
        let Some(entry) = table.get_mut(uid) else {
            tracing::warn!(uid, "release of an unlocked uid");
            return;
        };
        entry.held = false;
        if entry.waiters == 0 {
            table.remove(uid);
        } else {
            self.released.notify_all();
        }
    }

    pub fn is_locked(&self, uid: &str) -> bool {
        self.table.lock().get(uid).is_some_and(|entry| entry.held)
    }

    /// Workers currently blocked on `uid`
    pub fn waiters(&self, uid: &str) -> usize {
        self.table.lock().get(uid).map_or(0, |entry| entry.waiters)
    }

    pub fn held_count(&self) -> usize {
        self.table.lock().values().filter(|entry| entry.held).count()
    }

    /// Acquire and return a guard that releases on drop, including during unwinding
    pub fn lock(self: &Arc<Self>, uid: &str) -> UnpackingGuard {
        self.acquire(uid);
        UnpackingGuard {
            manager: Arc::clone(self),
            uid: uid.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct UnpackingGuard {
    manager: Arc<UnpackingLockManager>,
    uid: String,
}

impl UnpackingGuard {
    pub fn uid(&self) -> &str {
        &self.uid
    }
}

impl Drop for UnpackingGuard {
    fn drop(&mut self) {
        self.manager.release(&self.uid);
    }
}
