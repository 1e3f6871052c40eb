//! Non-blocking per-upload write locks.

use dashmap::{DashMap, mapref::entry::Entry};
use std::sync::Arc;

/// Set of upload ids with a write in flight.
///
/// `try_acquire` never waits: a held id returns `None` immediately. Distinct
/// ids never contend beyond the shard of the map they hash into.
#[derive(Clone, Default)]
pub struct UploadLocks {
    held: Arc<DashMap<String, ()>>,
}

/// Releases its id when dropped, including when the owning future is cancelled.
#[derive(Debug)]
pub struct UploadLockGuard {
    held: Arc<DashMap<String, ()>>,
    id: String,
}

impl UploadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, id: &str) -> Option<UploadLockGuard> {
        match self.held.entry(id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(UploadLockGuard {
                    held: Arc::clone(&self.held),
                    id: id.to_string(),
                })
            }
        }
    }

    pub fn is_locked(&self, id: &str) -> bool {
        self.held.contains_key(id)
    }
}

impl Drop for UploadLockGuard {
    fn drop(&mut self) {
        self.held.remove(&self.id);
    }
}
