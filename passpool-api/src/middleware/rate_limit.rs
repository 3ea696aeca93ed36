use axum::{
    extract::{Request, State},
    http::{Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use passpool_store::redis_repo::rate_limit_key;

use crate::middleware::auth::RiderClaims;
use crate::state::AppState;

/// Per-rider fixed window on mutating routes. Limiter failures let the request through.
pub async fn rate_limit_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if req.method() == Method::GET {
        return next.run(req).await;
    }
    let rider = req.extensions().get::<RiderClaims>().map(|c| c.sub);
    let (Some(limiter), Some(rider)) = (state.rate_limiter.clone(), rider) else {
        return next.run(req).await;
    };

    let key = rate_limit_key(&rider);
    match limiter
        .hit(&key, state.rate_limit.requests, state.rate_limit.window_seconds)
        .await
    {
        Ok(true) => next.run(req).await,
        Ok(false) => (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Rate limiter unavailable, allowing request");
            next.run(req).await
        }
    }
}
