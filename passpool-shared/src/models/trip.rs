use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one scheduled run of a service on a given day.
///
/// Trips are owned by the schedule import; the engine only uses this as a scope key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TripId {
    pub service_ref: String,
    pub service_date: NaiveDate,
}

impl TripId {
    pub fn new(service_ref: impl Into<String>, service_date: NaiveDate) -> Self {
        Self {
            service_ref: service_ref.into(),
            service_date,
        }
    }

    /// Stable key used for message partitioning and cache keys
    pub fn key(&self) -> String {
        format!("{}@{}", self.service_ref, self.service_date)
    }
}

impl fmt::Display for TripId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service_ref, self.service_date)
    }
}
