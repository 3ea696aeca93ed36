use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::NaiveDate;
use futures_util::{Stream, StreamExt};
use passpool_core::model::{Coach, GroupView};
use passpool_shared::TripId;
use serde::Deserialize;
use std::convert::Infallible;

use crate::error::AppError;
use crate::middleware::RiderClaims;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/trips/{service_ref}/{date}/join", post(join))
        .route("/v1/trips/{service_ref}/{date}/leave", post(leave))
        .route("/v1/trips/{service_ref}/{date}/groups", get(list_groups))
        .route("/v1/trips/{service_ref}/{date}/me", get(my_group))
        .route("/v1/trips/{service_ref}/{date}/stream", get(stream_changes))
        .route(
            "/v1/trips/{service_ref}/{date}/steward",
            post(volunteer_steward).delete(step_down),
        )
        .route("/v1/trips/{service_ref}/{date}/pass", post(upload_pass))
        .route("/v1/trips/{service_ref}/{date}/payment", post(mark_paid))
        .route("/v1/trips/{service_ref}/{date}/coach", post(set_coach))
        .route("/v1/trips/{service_ref}/{date}/check-in", post(check_in))
}

type TripPath = Path<(String, NaiveDate)>;

fn trip_id((service_ref, date): (String, NaiveDate)) -> Result<TripId, AppError> {
    let service_ref = service_ref.trim();
    if service_ref.is_empty() {
        return Err(AppError::ValidationError("service_ref is empty".to_string()));
    }
    Ok(TripId::new(service_ref, date))
}

#[derive(Debug, Deserialize)]
pub struct UploadPassRequest {
    pub ticket_id: String,
    pub screenshot_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentRequest {
    pub sent: bool,
}

#[derive(Debug, Deserialize)]
pub struct CoachRequest {
    pub coach: Option<Coach>,
}

async fn join(
    State(state): State<AppState>,
    Extension(claims): Extension<RiderClaims>,
    Path(path): TripPath,
) -> Result<Json<GroupView>, AppError> {
    let view = state.gateway.join(trip_id(path)?, claims.sub).await?;
    Ok(Json(view))
}

async fn leave(
    State(state): State<AppState>,
    Extension(claims): Extension<RiderClaims>,
    Path(path): TripPath,
) -> Result<StatusCode, AppError> {
    state.gateway.leave(trip_id(path)?, claims.sub).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_groups(
    State(state): State<AppState>,
    Path(path): TripPath,
) -> Result<Json<Vec<GroupView>>, AppError> {
    let views = state.gateway.groups(&trip_id(path)?).await?;
    Ok(Json(views))
}

async fn my_group(
    State(state): State<AppState>,
    Extension(claims): Extension<RiderClaims>,
    Path(path): TripPath,
) -> Result<Json<GroupView>, AppError> {
    let view = state.gateway.my_group(&trip_id(path)?, claims.sub).await?;
    Ok(Json(view))
}

/// `trip_changed` events carry no group data; clients refetch `/groups` or `/me`
async fn stream_changes(
    State(state): State<AppState>,
    Path(path): TripPath,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let trip_id = trip_id(path)?;
    tracing::debug!(trip = %trip_id, "New change stream subscriber");

    let events = state.gateway.subscribe(trip_id).map(|event| {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().event("trip_changed").data(payload))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn volunteer_steward(
    State(state): State<AppState>,
    Extension(claims): Extension<RiderClaims>,
    Path(path): TripPath,
) -> Result<Json<GroupView>, AppError> {
    let view = state.gateway.volunteer_steward(trip_id(path)?, claims.sub).await?;
    Ok(Json(view))
}

async fn step_down(
    State(state): State<AppState>,
    Extension(claims): Extension<RiderClaims>,
    Path(path): TripPath,
) -> Result<Json<GroupView>, AppError> {
    let view = state.gateway.step_down(trip_id(path)?, claims.sub).await?;
    Ok(Json(view))
}

async fn upload_pass(
    State(state): State<AppState>,
    Extension(claims): Extension<RiderClaims>,
    Path(path): TripPath,
    Json(req): Json<UploadPassRequest>,
) -> Result<Json<GroupView>, AppError> {
    let view = state
        .gateway
        .upload_pass(trip_id(path)?, claims.sub, req.ticket_id, req.screenshot_ref)
        .await?;
    Ok(Json(view))
}

async fn mark_paid(
    State(state): State<AppState>,
    Extension(claims): Extension<RiderClaims>,
    Path(path): TripPath,
    Json(req): Json<PaymentRequest>,
) -> Result<Json<GroupView>, AppError> {
    let view = state.gateway.mark_paid(trip_id(path)?, claims.sub, req.sent).await?;
    Ok(Json(view))
}

async fn set_coach(
    State(state): State<AppState>,
    Extension(claims): Extension<RiderClaims>,
    Path(path): TripPath,
    Json(req): Json<CoachRequest>,
) -> Result<Json<GroupView>, AppError> {
    let view = state.gateway.set_coach(trip_id(path)?, claims.sub, req.coach).await?;
    Ok(Json(view))
}

async fn check_in(
    State(state): State<AppState>,
    Extension(claims): Extension<RiderClaims>,
    Path(path): TripPath,
) -> Result<Json<GroupView>, AppError> {
    let view = state.gateway.check_in(trip_id(path)?, claims.sub).await?;
    Ok(Json(view))
}
