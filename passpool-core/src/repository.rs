use async_trait::async_trait;
use passpool_shared::TripId;

use crate::model::{Group, GroupId, Membership, MembershipId, RiderInterest, TripSnapshot, UserId};
use crate::CoreError;

/// The rider-interest half of a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterestChange {
    Add(RiderInterest),
    Remove(UserId),
}

/// One atomic write against a trip. Applied in full or not at all, and only if the
/// trip is still at `expected_version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripPlan {
    pub trip_id: TripId,
    pub expected_version: i64,
    pub interest_change: Option<InterestChange>,
    pub created_groups: Vec<Group>,
    pub updated_groups: Vec<Group>,
    pub deleted_groups: Vec<GroupId>,
    pub created_memberships: Vec<Membership>,
    pub updated_memberships: Vec<Membership>,
    pub deleted_memberships: Vec<MembershipId>,
}

impl TripPlan {
    pub fn new(trip_id: TripId, expected_version: i64) -> Self {
        Self {
            trip_id,
            expected_version,
            interest_change: None,
            created_groups: Vec::new(),
            updated_groups: Vec::new(),
            deleted_groups: Vec::new(),
            created_memberships: Vec::new(),
            updated_memberships: Vec::new(),
            deleted_memberships: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.interest_change.is_none()
            && self.created_groups.is_empty()
            && self.updated_groups.is_empty()
            && self.deleted_groups.is_empty()
            && self.created_memberships.is_empty()
            && self.updated_memberships.is_empty()
            && self.deleted_memberships.is_empty()
    }

    /// Groups written by this plan that carry pass proof
    pub fn pass_hashes(&self) -> impl Iterator<Item = (GroupId, &str)> {
        self.created_groups
            .iter()
            .chain(self.updated_groups.iter())
            .filter_map(|g| g.pass.as_ref().map(|p| (g.id, p.ticket_hash.as_str())))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Version conflict on trip {trip_id}: expected version {expected}")]
    Conflict { trip_id: TripId, expected: i64 },
    #[error("Pass with hash {0} is already registered to another group")]
    DuplicatePass(String),
    #[error("Invalid stored state: {0}")]
    Invalid(#[from] CoreError),
    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Transactional access to riders, groups and memberships of one trip at a time
#[async_trait]
pub trait GroupStore: Send + Sync {
    /// Read interests, groups and memberships at one consistent version.
    /// Unknown trips load as an empty snapshot at version 0.
    async fn load_trip(&self, trip_id: &TripId) -> StoreResult<TripSnapshot>;

    /// Apply `plan` atomically and return the new version.
    async fn commit(&self, plan: &TripPlan) -> StoreResult<i64>;

    /// Whether any group other than `except` already holds this ticket hash
    async fn pass_hash_in_use(
        &self,
        ticket_hash: &str,
        except: Option<GroupId>,
    ) -> StoreResult<bool>;
}
