//! File-backed pending queue for the command-line client
//!
//! Keeps the queue in memory and rewrites a JSON array on every change, so
//! messages typed while offline survive a restart.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chatsync_core::{PendingQueue, SyncEvent};
use parking_lot::Mutex;
use tracing::{debug, warn};

pub struct FilePendingQueue {
    path: PathBuf,
    events: Mutex<Vec<SyncEvent>>,
}

impl FilePendingQueue {
    /// Open the queue at `path`, loading whatever a previous run left there
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let events = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read queue {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Corrupt queue {}", path.display()))?
        } else {
            Vec::new()
        };
        debug!(path = %path.display(), queued = events.len(), "Opened pending queue");
        Ok(Self {
            path,
            events: Mutex::new(events),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    fn persist(&self, events: &[SyncEvent]) {
        if let Err(e) = write_queue(&self.path, events) {
            warn!(path = %self.path.display(), error = %e, "Failed to persist pending queue");
        }
    }
}

fn write_queue(path: &Path, events: &[SyncEvent]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string(events)?;
    std::fs::write(path, text)?;
    Ok(())
}

impl PendingQueue for FilePendingQueue {
    fn dequeue_pending(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    fn enqueue_pending(&self, event: SyncEvent) {
        let mut events = self.events.lock();
        events.push(event);
        self.persist(&events);
    }

    fn clear_pending(&self) {
        let mut events = self.events.lock();
        events.clear();
        self.persist(&events);
    }
}
