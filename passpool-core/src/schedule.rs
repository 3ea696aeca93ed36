use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use passpool_shared::TripId;
use serde::{Deserialize, Serialize};

use crate::repository::StoreResult;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripStatus {
    Scheduled,
    Boarding,
    Departed,
    Cancelled,
}

impl TripStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripStatus::Scheduled => "SCHEDULED",
            TripStatus::Boarding => "BOARDING",
            TripStatus::Departed => "DEPARTED",
            TripStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SCHEDULED" => Some(TripStatus::Scheduled),
            "BOARDING" => Some(TripStatus::Boarding),
            "DEPARTED" => Some(TripStatus::Departed),
            "CANCELLED" => Some(TripStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotJoinableReason {
    UnknownTrip,
    CutoffPassed,
    NotScheduled,
}

/// Departure and status of a trip as seen by the schedule
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TripWindow {
    pub departs_at: DateTime<Utc>,
    pub status: TripStatus,
}

impl TripWindow {
    /// Join/leave is allowed only for scheduled trips strictly before `departs_at - cutoff`
    pub fn check_joinable(&self, now: DateTime<Utc>, cutoff: Duration) -> Result<(), NotJoinableReason> {
        if self.status != TripStatus::Scheduled {
            return Err(NotJoinableReason::NotScheduled);
        }
        if now >= self.departs_at - cutoff {
            return Err(NotJoinableReason::CutoffPassed);
        }
        Ok(())
    }
}

/// Read-only view of the imported timetable
#[async_trait]
pub trait ScheduleLookup: Send + Sync {
    async fn trip_window(&self, trip_id: &TripId) -> StoreResult<Option<TripWindow>>;
}
