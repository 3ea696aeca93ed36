use uuid::Uuid;
use super::trip::TripId;

/// Why a trip's group state changed
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeReason {
    Joined,
    Left,
    Rebalanced,
    StewardChanged,
    PassUploaded,
    MemberUpdated,
    /// Emitted to a subscriber that fell behind; refetch everything
    Resync,
}

/// Payload-free refresh signal: subscribers refetch the trip's groups on receipt.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq, Eq)]
pub struct TripChangedEvent {
    pub trip_id: TripId,
    pub version: i64,
    pub reason: ChangeReason,
    pub changed_at: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct GroupDissolvedEvent {
    pub trip_id: TripId,
    pub group_id: Uuid,
    pub group_number: u32,
    pub steward_id: Option<Uuid>,
    pub had_pass_proof: bool,
    pub dissolved_at: i64,
}
