use dashmap::DashMap;
use passpool_shared::TripId;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per trip. Operations on different trips never contend.
///
/// Entries are created on first use and removed once nobody holds or waits on them.
#[derive(Clone, Default)]
pub struct TripLocks {
    locks: Arc<DashMap<TripId, Arc<Mutex<()>>>>,
}

impl TripLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `trip_id`
    pub async fn acquire(&self, trip_id: &TripId) -> TripGuard {
        let lock = self.locks.entry(trip_id.clone()).or_default().clone();
        let guard = lock.lock_owned().await;

        TripGuard {
            trip_id: trip_id.clone(),
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Number of trips with a live lock entry
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

pub struct TripGuard {
    trip_id: TripId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<TripId, Arc<Mutex<()>>>>,
}

impl Drop for TripGuard {
    fn drop(&mut self) {
        // release before checking whether anyone else still references the entry
        drop(self.guard.take());
        self.locks
            .remove_if(&self.trip_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
