//! Named exclusive leases
//!
//! A [`LockManager`] hands out at most one [`Lease`] per name at a time.
//! Waiters queue in FIFO order and the lease is released when the holder
//! drops it, including when the holding task is aborted. Leader election and
//! tab liveness both rely on that last property: a dead context cannot keep a
//! lease.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

/// Registry of named locks
#[derive(Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Exclusive hold on a name, released on drop
pub struct Lease {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl Lease {
    /// The leased name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        trace!(lease = %self.name, "Lease released");
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("name", &self.name).finish()
    }
}

impl LockManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, name: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait until the name is free and take it
    pub async fn request(&self, name: &str) -> Lease {
        let guard = self.lock_for(name).lock_owned().await;
        trace!(lease = %name, "Lease acquired");
        Lease {
            name: name.to_string(),
            _guard: guard,
        }
    }

    /// Take the name only if nobody holds it
    pub fn try_request(&self, name: &str) -> Option<Lease> {
        let guard = self.lock_for(name).try_lock_owned().ok()?;
        Some(Lease {
            name: name.to_string(),
            _guard: guard,
        })
    }

    /// Whether someone currently holds the name
    pub fn is_held(&self, name: &str) -> bool {
        match self.locks.lock().get(name) {
            Some(lock) => lock.try_lock().is_err(),
            None => false,
        }
    }

    /// Drop bookkeeping for names nobody holds or waits on
    pub fn prune(&self) {
        self.locks
            .lock()
            .retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
    }
}
