pub mod events;
pub mod model;
pub mod repository;
pub mod schedule;

pub use passpool_shared::TripId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Inconsistent trip state for {trip_id}: {detail}")]
    InconsistentState { trip_id: TripId, detail: String },
}

pub type CoreResult<T> = Result<T, CoreError>;
