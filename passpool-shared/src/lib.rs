pub mod models;
pub mod pii;

pub use models::trip::TripId;
pub use pii::Masked;
