// Per-contact exclusive access for tag / custom-field read-modify-write cycles

use autoflow_shared::ContactId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

type ContactKey = (Uuid, ContactId);

#[derive(Default)]
pub struct ContactLocks {
    locks: DashMap<ContactKey, Arc<Mutex<()>>>,
}

impl ContactLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to one contact. Hold the guard for a single
    /// mutation only; never across a suspension.
    pub async fn acquire(&self, owner_id: Uuid, contact_id: ContactId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry((owner_id, contact_id))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        lock.lock_owned().await
    }

    /// Drop entries nobody is holding or waiting on. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.len()
    }
}
