pub mod auth;
pub mod rate_limit;

pub use auth::{rider_auth_middleware, RiderClaims};
pub use rate_limit::rate_limit_middleware;
