use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

/// Keyed mutex registry: one lock per employee, created on first use.
#[derive(Default)]
pub struct EmployeeLocks {
    locks: DashMap<Ulid, Arc<Mutex<()>>>,
}

impl EmployeeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to one employee's allocations.
    pub async fn lock(&self, employee_id: Ulid) -> OwnedMutexGuard<()> {
        // clone under the shard lock, await outside it
        let lock = self.locks.entry(employee_id).or_default().clone();
        lock.lock_owned().await
    }

    /// Drop entries that nobody holds or waits on. Returns how many went.
    pub fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.locks.len())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
