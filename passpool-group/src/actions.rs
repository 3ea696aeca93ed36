use chrono::{DateTime, Utc};
use passpool_core::model::{Coach, GroupState, PassProof, TripSnapshot, UserId};
use passpool_core::repository::TripPlan;
use passpool_shared::models::events::ChangeReason;
use passpool_shared::Masked;
use sha2::{Digest, Sha256};

use crate::error::{GroupError, GroupResult};

/// Things a grouped rider or their steward can do to their own group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupAction {
    VolunteerSteward,
    StepDown,
    UploadPass {
        ticket_id: String,
        screenshot_ref: Option<String>,
    },
    MarkPaid(bool),
    SetCoach(Option<Coach>),
    CheckIn,
}

impl GroupAction {
    pub fn reason(&self) -> ChangeReason {
        match self {
            GroupAction::VolunteerSteward | GroupAction::StepDown => ChangeReason::StewardChanged,
            GroupAction::UploadPass { .. } => ChangeReason::PassUploaded,
            GroupAction::MarkPaid(_) | GroupAction::SetCoach(_) | GroupAction::CheckIn => {
                ChangeReason::MemberUpdated
            }
        }
    }
}

/// Ticket identifiers are compared without whitespace and case
pub fn normalize_ticket_id(ticket_id: &str) -> String {
    ticket_id
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Hex SHA-256 of the normalized ticket identifier
pub fn ticket_hash(ticket_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_ticket_id(ticket_id).as_bytes());
    hex::encode(hasher.finalize())
}

/// Build the commit for `action` performed by `user_id`.
///
/// Repeating an action that is already in effect yields an empty plan.
pub fn plan_action(
    snapshot: &TripSnapshot,
    user_id: UserId,
    action: &GroupAction,
    now: DateTime<Utc>,
) -> GroupResult<TripPlan> {
    let state = snapshot.group_of(user_id).ok_or(GroupError::NotJoined)?;
    let mut plan = TripPlan::new(snapshot.trip_id.clone(), snapshot.version);

    match action {
        GroupAction::VolunteerSteward => match state.group.steward_id {
            Some(steward) if steward == user_id => {}
            Some(_) => return Err(GroupError::StewardAlreadyAssigned),
            None => {
                let mut group = state.group.clone();
                group.steward_id = Some(user_id);
                group.updated_at = now;
                plan.updated_groups.push(group);
            }
        },
        GroupAction::StepDown => {
            require_steward(state, user_id)?;
            let mut group = state.group.clone();
            group.steward_id = None;
            group.updated_at = now;
            plan.updated_groups.push(group);
        }
        GroupAction::UploadPass {
            ticket_id,
            screenshot_ref,
        } => {
            require_steward(state, user_id)?;
            let normalized = normalize_ticket_id(ticket_id);
            if normalized.is_empty() {
                return Err(GroupError::InvalidInput("ticket id is empty".to_string()));
            }
            let hash = ticket_hash(&normalized);
            let unchanged = state.group.pass.as_ref().is_some_and(|p| {
                p.ticket_hash == hash && p.screenshot_ref == *screenshot_ref
            });
            if !unchanged {
                let mut group = state.group.clone();
                group.pass = Some(PassProof {
                    ticket_id: Masked::new(normalized),
                    ticket_hash: hash,
                    activated_at: now,
                    screenshot_ref: screenshot_ref.clone(),
                });
                group.updated_at = now;
                plan.updated_groups.push(group);
            }
        }
        GroupAction::MarkPaid(sent) => {
            let mut membership = member(state, user_id)?;
            if membership.payment_marked_sent_at.is_some() != *sent {
                membership.payment_marked_sent_at = sent.then_some(now);
                plan.updated_memberships.push(membership);
            }
        }
        GroupAction::SetCoach(coach) => {
            let mut membership = member(state, user_id)?;
            if membership.coach != *coach {
                membership.coach = *coach;
                plan.updated_memberships.push(membership);
            }
        }
        GroupAction::CheckIn => {
            let mut membership = member(state, user_id)?;
            if membership.checked_in_at.is_none() {
                membership.checked_in_at = Some(now);
                plan.updated_memberships.push(membership);
            }
        }
    }

    Ok(plan)
}

fn require_steward(state: &GroupState, user_id: UserId) -> GroupResult<()> {
    if state.group.steward_id == Some(user_id) {
        Ok(())
    } else {
        Err(GroupError::NotSteward)
    }
}

fn member(state: &GroupState, user_id: UserId) -> GroupResult<passpool_core::model::Membership> {
    state
        .membership_of(user_id)
        .cloned()
        .ok_or(GroupError::NotJoined)
}
