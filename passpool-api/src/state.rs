use passpool_group::TripGateway;
use passpool_store::app_config::RateLimitConfig;
use passpool_store::RateLimiter;
use prometheus::Registry;
use std::sync::Arc;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
}

#[derive(Clone)]
pub struct AppState {
    pub gateway: TripGateway,
    /// Rate limiting is skipped when no limiter is configured
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
    pub rate_limit: RateLimitConfig,
    pub auth: AuthConfig,
    pub registry: Registry,
}
