use async_trait::async_trait;
use passpool_core::model::{GroupId, TripSnapshot};
use passpool_core::repository::{GroupStore, StoreError, StoreResult, TripPlan};
use passpool_core::schedule::{ScheduleLookup, TripWindow};
use passpool_shared::TripId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Process-local store with the same commit semantics as the Postgres one.
///
/// Used for tests and single-node local runs. The fault hooks let tests force
/// version conflicts and slow reads.
#[derive(Default)]
pub struct InMemoryStore {
    trips: RwLock<HashMap<TripId, TripSnapshot>>,
    windows: RwLock<HashMap<TripId, TripWindow>>,
    failing_commits: AtomicU32,
    slow_loads: AtomicU32,
    slow_load_ms: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `count` commits with a version conflict
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Stall the next `count` loads for `delay`
    pub fn delay_next_loads(&self, count: u32, delay: Duration) {
        self.slow_load_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
        self.slow_loads.store(count, Ordering::SeqCst);
    }

    pub async fn set_trip_window(&self, trip_id: TripId, window: TripWindow) {
        self.windows.write().await.insert(trip_id, window);
    }

    /// Replace a trip's stored state wholesale
    pub async fn seed(&self, mut snapshot: TripSnapshot) {
        snapshot.normalize();
        self.trips
            .write()
            .await
            .insert(snapshot.trip_id.clone(), snapshot);
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl GroupStore for InMemoryStore {
    async fn load_trip(&self, trip_id: &TripId) -> StoreResult<TripSnapshot> {
        if Self::take_one(&self.slow_loads) {
            let delay = Duration::from_millis(self.slow_load_ms.load(Ordering::SeqCst));
            tokio::time::sleep(delay).await;
        }

        let trips = self.trips.read().await;
        Ok(trips
            .get(trip_id)
            .cloned()
            .unwrap_or_else(|| TripSnapshot::empty(trip_id.clone())))
    }

    async fn commit(&self, plan: &TripPlan) -> StoreResult<i64> {
        let mut trips = self.trips.write().await;
        let current = trips
            .get(&plan.trip_id)
            .cloned()
            .unwrap_or_else(|| TripSnapshot::empty(plan.trip_id.clone()));

        if Self::take_one(&self.failing_commits) || current.version != plan.expected_version {
            return Err(StoreError::Conflict {
                trip_id: plan.trip_id.clone(),
                expected: plan.expected_version,
            });
        }

        for (group_id, hash) in plan.pass_hashes() {
            let taken = trips.values().flat_map(|s| s.groups.iter()).any(|state| {
                state.group.id != group_id
                    && state
                        .group
                        .pass
                        .as_ref()
                        .is_some_and(|p| p.ticket_hash == hash)
            });
            if taken {
                return Err(StoreError::DuplicatePass(hash.to_string()));
            }
        }

        let next = current.apply(plan)?;
        let version = next.version;
        debug!(trip = %plan.trip_id, version, "Committed trip plan in memory");
        trips.insert(plan.trip_id.clone(), next);
        Ok(version)
    }

    async fn pass_hash_in_use(&self, ticket_hash: &str, except: Option<GroupId>) -> StoreResult<bool> {
        let trips = self.trips.read().await;
        Ok(trips
            .values()
            .flat_map(|s| s.groups.iter())
            .filter(|state| Some(state.group.id) != except)
            .any(|state| {
                state
                    .group
                    .pass
                    .as_ref()
                    .is_some_and(|p| p.ticket_hash == ticket_hash)
            }))
    }
}

#[async_trait]
impl ScheduleLookup for InMemoryStore {
    async fn trip_window(&self, trip_id: &TripId) -> StoreResult<Option<TripWindow>> {
        Ok(self.windows.read().await.get(trip_id).copied())
    }
}
