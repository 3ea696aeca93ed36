use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use passpool_group::GroupError;
use serde_json::json;

#[derive(Debug)]
pub enum AppError {
    Group(GroupError),
    ValidationError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Group(err) => match err {
                GroupError::AlreadyJoined
                | GroupError::StewardAlreadyAssigned
                | GroupError::DuplicatePass => (StatusCode::CONFLICT, err.to_string()),
                GroupError::NotJoined => (StatusCode::NOT_FOUND, err.to_string()),
                GroupError::NotSteward => (StatusCode::FORBIDDEN, err.to_string()),
                GroupError::TripNotJoinable(reason) => {
                    let body = Json(json!({
                        "error": "Trip is not joinable",
                        "reason": reason,
                    }));
                    return (StatusCode::UNPROCESSABLE_ENTITY, body).into_response();
                }
                GroupError::RebalanceConflict { .. } => {
                    let body = Json(json!({ "error": err.to_string() }));
                    return (
                        StatusCode::SERVICE_UNAVAILABLE,
                        [(header::RETRY_AFTER, "1")],
                        body,
                    )
                        .into_response();
                }
                GroupError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
                GroupError::Internal(msg) => {
                    tracing::error!("Internal Server Error: {}", msg);
                    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
                }
            },
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<GroupError> for AppError {
    fn from(err: GroupError) -> Self {
        Self::Group(err)
    }
}
