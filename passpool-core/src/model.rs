use chrono::{DateTime, Utc};
use passpool_shared::{Masked, TripId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::repository::{InterestChange, TripPlan};
use crate::{CoreError, CoreResult};

pub type UserId = Uuid;
pub type GroupId = Uuid;
pub type MembershipId = Uuid;

/// Largest number of riders that can share one pass
pub const MAX_GROUP_SIZE: usize = 5;

/// A rider's request to be grouped for a trip
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RiderInterest {
    pub trip_id: TripId,
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
}

impl RiderInterest {
    pub fn new(trip_id: TripId, user_id: UserId, joined_at: DateTime<Utc>) -> Self {
        Self {
            trip_id,
            user_id,
            joined_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoachLevel {
    Lower,
    Upper,
    Single,
}

impl CoachLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoachLevel::Lower => "LOWER",
            CoachLevel::Upper => "UPPER",
            CoachLevel::Single => "SINGLE",
        }
    }

    pub fn parse(value: &str) -> CoreResult<Self> {
        match value {
            "LOWER" => Ok(CoachLevel::Lower),
            "UPPER" => Ok(CoachLevel::Upper),
            "SINGLE" => Ok(CoachLevel::Single),
            other => Err(CoreError::ValidationError(format!("unknown coach level {}", other))),
        }
    }
}

/// Self-reported position of a rider on the train
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Coach {
    pub number: u16,
    pub level: CoachLevel,
}

/// Proof that the steward bought the shared pass
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PassProof {
    pub ticket_id: Masked<String>,
    /// Hex SHA-256 of the normalized ticket identifier, unique system-wide
    pub ticket_hash: String,
    pub activated_at: DateTime<Utc>,
    pub screenshot_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub trip_id: TripId,
    /// 1-based, unique within the trip
    pub number: u32,
    pub steward_id: Option<UserId>,
    /// Minor currency units
    pub cost_per_person: i32,
    pub pass: Option<PassProof>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Group {
    pub fn new(trip_id: TripId, number: u32, cost_per_person: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            trip_id,
            number,
            steward_id: None,
            cost_per_person,
            pass: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_pass_proof(&self) -> bool {
        self.pass.is_some()
    }
}

/// A rider's seat in a group. Payment, coach and check-in state belong to the rider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Membership {
    pub id: MembershipId,
    pub group_id: GroupId,
    pub user_id: UserId,
    pub payment_marked_sent_at: Option<DateTime<Utc>>,
    pub coach: Option<Coach>,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Membership {
    pub fn new(group_id: GroupId, user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id,
            user_id,
            payment_marked_sent_at: None,
            coach: None,
            checked_in_at: None,
            created_at: now,
        }
    }
}

/// A group together with its memberships, members in join order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupState {
    pub group: Group,
    pub members: Vec<Membership>,
}

impl GroupState {
    pub fn member_ids(&self) -> Vec<UserId> {
        self.members.iter().map(|m| m.user_id).collect()
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.members.iter().any(|m| m.user_id == user_id)
    }

    pub fn membership_of(&self, user_id: UserId) -> Option<&Membership> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    pub fn view(&self) -> GroupView {
        GroupView {
            group_id: self.group.id,
            group_number: self.group.number,
            cost_per_person: self.group.cost_per_person,
            steward_id: self.group.steward_id,
            members: self
                .members
                .iter()
                .map(|m| MemberView {
                    user_id: m.user_id,
                    payment_marked_sent: m.payment_marked_sent_at.is_some(),
                    coach: m.coach,
                    checked_in: m.checked_in_at.is_some(),
                })
                .collect(),
            pass: self.group.pass.as_ref().map(|p| PassView {
                ticket_hint: p.ticket_id.hint(),
                activated_at: p.activated_at,
                screenshot_ref: p.screenshot_ref.clone(),
            }),
        }
    }
}

/// What a rider sees of their group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupView {
    pub group_id: GroupId,
    pub group_number: u32,
    pub cost_per_person: i32,
    pub steward_id: Option<UserId>,
    pub members: Vec<MemberView>,
    pub pass: Option<PassView>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberView {
    pub user_id: UserId,
    pub payment_marked_sent: bool,
    pub coach: Option<Coach>,
    pub checked_in: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PassView {
    pub ticket_hint: String,
    pub activated_at: DateTime<Utc>,
    pub screenshot_ref: Option<String>,
}

/// Everything the engine knows about one trip, read at a single version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripSnapshot {
    pub trip_id: TripId,
    pub version: i64,
    pub interests: Vec<RiderInterest>,
    pub groups: Vec<GroupState>,
}

impl TripSnapshot {
    pub fn empty(trip_id: TripId) -> Self {
        Self {
            trip_id,
            version: 0,
            interests: Vec::new(),
            groups: Vec::new(),
        }
    }

    pub fn interest(&self, user_id: UserId) -> Option<&RiderInterest> {
        self.interests.iter().find(|i| i.user_id == user_id)
    }

    pub fn group_of(&self, user_id: UserId) -> Option<&GroupState> {
        self.groups.iter().find(|g| g.contains(user_id))
    }

    pub fn views(&self) -> Vec<GroupView> {
        self.groups.iter().map(GroupState::view).collect()
    }

    pub fn membership_count(&self) -> usize {
        self.groups.iter().map(|g| g.members.len()).sum()
    }

    /// Position of each rider in join order (joined_at, then user id)
    pub fn join_order(&self) -> HashMap<UserId, usize> {
        let mut interests: Vec<&RiderInterest> = self.interests.iter().collect();
        interests.sort_by(|a, b| (a.joined_at, a.user_id).cmp(&(b.joined_at, b.user_id)));
        interests
            .into_iter()
            .enumerate()
            .map(|(idx, i)| (i.user_id, idx))
            .collect()
    }

    /// Sort interests, groups and members into their canonical order
    pub fn normalize(&mut self) {
        self.interests
            .sort_by(|a, b| (a.joined_at, a.user_id).cmp(&(b.joined_at, b.user_id)));
        let order = self.join_order();
        self.groups.sort_by_key(|g| g.group.number);
        for state in &mut self.groups {
            state.members.sort_by_key(|m| {
                (order.get(&m.user_id).copied().unwrap_or(usize::MAX), m.user_id)
            });
        }
    }

    /// Project the state this snapshot would have after `plan` commits.
    ///
    /// Deleting a group drops its memberships with it. The result is validated.
    pub fn apply(&self, plan: &TripPlan) -> CoreResult<TripSnapshot> {
        if plan.trip_id != self.trip_id {
            return Err(self.inconsistent(format!("plan targets trip {}", plan.trip_id)));
        }

        let mut next = self.clone();

        match &plan.interest_change {
            Some(InterestChange::Add(interest)) => {
                if next.interest(interest.user_id).is_some() {
                    return Err(self.inconsistent(format!(
                        "rider {} already has an interest",
                        interest.user_id
                    )));
                }
                next.interests.push(interest.clone());
            }
            Some(InterestChange::Remove(user_id)) => {
                let before = next.interests.len();
                next.interests.retain(|i| i.user_id != *user_id);
                if next.interests.len() == before {
                    return Err(self.inconsistent(format!("rider {} has no interest", user_id)));
                }
            }
            None => {}
        }

        let deleted_memberships: HashSet<MembershipId> =
            plan.deleted_memberships.iter().copied().collect();
        let deleted_groups: HashSet<GroupId> = plan.deleted_groups.iter().copied().collect();

        for state in &mut next.groups {
            state.members.retain(|m| !deleted_memberships.contains(&m.id));
        }
        next.groups.retain(|s| !deleted_groups.contains(&s.group.id));

        for group in &plan.updated_groups {
            let state = next
                .groups
                .iter_mut()
                .find(|s| s.group.id == group.id)
                .ok_or_else(|| self.inconsistent(format!("updated group {} missing", group.id)))?;
            state.group = group.clone();
        }

        for group in &plan.created_groups {
            if next.groups.iter().any(|s| s.group.id == group.id) {
                return Err(self.inconsistent(format!("group {} already exists", group.id)));
            }
            next.groups.push(GroupState {
                group: group.clone(),
                members: Vec::new(),
            });
        }

        for membership in &plan.created_memberships {
            let state = next
                .groups
                .iter_mut()
                .find(|s| s.group.id == membership.group_id)
                .ok_or_else(|| {
                    self.inconsistent(format!("membership targets missing group {}", membership.group_id))
                })?;
            state.members.push(membership.clone());
        }

        for membership in &plan.updated_memberships {
            let slot = next
                .groups
                .iter_mut()
                .flat_map(|s| s.members.iter_mut())
                .find(|m| m.id == membership.id)
                .ok_or_else(|| self.inconsistent(format!("membership {} missing", membership.id)))?;
            *slot = membership.clone();
        }

        next.version += 1;
        next.normalize();
        next.validate()?;
        Ok(next)
    }

    /// Check the per-group and per-trip invariants
    pub fn validate(&self) -> CoreResult<()> {
        let mut seen = HashSet::new();

        for (idx, state) in self.groups.iter().enumerate() {
            let group = &state.group;
            if group.trip_id != self.trip_id {
                return Err(self.inconsistent(format!("group {} belongs to {}", group.id, group.trip_id)));
            }
            if group.number as usize != idx + 1 {
                return Err(self.inconsistent(format!(
                    "group {} has number {} at position {}",
                    group.id,
                    group.number,
                    idx + 1
                )));
            }
            if state.members.is_empty() || state.members.len() > MAX_GROUP_SIZE {
                return Err(self.inconsistent(format!(
                    "group {} has {} members",
                    group.number,
                    state.members.len()
                )));
            }
            if let Some(steward) = group.steward_id {
                if !state.contains(steward) {
                    return Err(self.inconsistent(format!(
                        "steward {} is not a member of group {}",
                        steward, group.number
                    )));
                }
            }
            for membership in &state.members {
                if membership.group_id != group.id {
                    return Err(self.inconsistent(format!("membership {} misfiled", membership.id)));
                }
                if !seen.insert(membership.user_id) {
                    return Err(self.inconsistent(format!(
                        "rider {} is in more than one group",
                        membership.user_id
                    )));
                }
            }
        }

        let interested: HashSet<UserId> = self.interests.iter().map(|i| i.user_id).collect();
        if interested != seen {
            return Err(self.inconsistent(format!(
                "{} interested riders but {} grouped riders",
                interested.len(),
                seen.len()
            )));
        }

        Ok(())
    }

    fn inconsistent(&self, detail: String) -> CoreError {
        CoreError::InconsistentState {
            trip_id: self.trip_id.clone(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn trip() -> TripId {
        TripId::new("RE 4417", NaiveDate::from_ymd_opt(2026, 10, 19).unwrap())
    }

    fn seeded(n: usize) -> (TripSnapshot, Vec<UserId>) {
        let trip_id = trip();
        let now = Utc::now();
        let users: Vec<UserId> = (0..n).map(|_| Uuid::new_v4()).collect();
        let group = Group::new(trip_id.clone(), 1, 700, now);
        let members = users
            .iter()
            .map(|u| Membership::new(group.id, *u, now))
            .collect();
        let interests = users
            .iter()
            .enumerate()
            .map(|(i, u)| RiderInterest::new(trip_id.clone(), *u, now + Duration::seconds(i as i64)))
            .collect();
        let snapshot = TripSnapshot {
            trip_id,
            version: 3,
            interests,
            groups: vec![GroupState { group, members }],
        };
        (snapshot, users)
    }

    #[test]
    fn test_validate_accepts_consistent_state() {
        let (snapshot, _) = seeded(3);
        assert!(snapshot.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_foreign_steward() {
        let (mut snapshot, _) = seeded(3);
        snapshot.groups[0].group.steward_id = Some(Uuid::new_v4());
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_ungrouped_rider() {
        let (mut snapshot, _) = seeded(2);
        snapshot
            .interests
            .push(RiderInterest::new(trip(), Uuid::new_v4(), Utc::now()));
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn test_apply_membership_update_bumps_version() {
        let (snapshot, users) = seeded(2);
        let mut membership = snapshot.groups[0].membership_of(users[0]).unwrap().clone();
        membership.checked_in_at = Some(Utc::now());

        let mut plan = TripPlan::new(snapshot.trip_id.clone(), snapshot.version);
        plan.updated_memberships.push(membership);

        let next = snapshot.apply(&plan).unwrap();
        assert_eq!(next.version, 4);
        assert!(next.groups[0].view().members[0].checked_in);
    }

    #[test]
    fn test_apply_rejects_duplicate_interest() {
        let (snapshot, users) = seeded(2);
        let mut plan = TripPlan::new(snapshot.trip_id.clone(), snapshot.version);
        plan.interest_change = Some(InterestChange::Add(RiderInterest::new(
            trip(),
            users[1],
            Utc::now(),
        )));
        assert!(snapshot.apply(&plan).is_err());
    }

    #[test]
    fn test_normalize_orders_members_by_join_time() {
        let (mut snapshot, users) = seeded(3);
        snapshot.groups[0].members.reverse();
        snapshot.normalize();
        assert_eq!(snapshot.groups[0].member_ids(), users);
    }
}
