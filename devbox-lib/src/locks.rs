use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// One async mutex per id. Guards are owned so they can be held across awaits.
#[derive(Default)]
pub struct KeyedMutex {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, id: Uuid) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the shard lock is released before awaiting
        let lock = self.locks.entry(id).or_default().clone();
        lock.lock_owned().await
    }

    /// Drops the entry for `id` once no one else holds or awaits it.
    pub fn forget(&self, id: Uuid) {
        self.locks.remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
