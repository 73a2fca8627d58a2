use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use club_core::ClubError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("declined: {0}")]
    Declined(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// A collaborator (gateway, ledger, verifier) failed.
    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error")]
    Internal,
}

impl From<ClubError> for ApiError {
    fn from(e: ClubError) -> Self {
        let msg = e.to_string();
        match e {
            ClubError::Validation(_) => ApiError::BadRequest(msg),
            ClubError::NotFound(_) => ApiError::NotFound(msg),
            ClubError::Conflict(_) => ApiError::Conflict(msg),
            ClubError::LedgerRejected(_) => ApiError::Declined(msg),
            ClubError::Encryption(_) | ClubError::LedgerFailed(_) | ClubError::Decryption(_) => {
                ApiError::Upstream(msg)
            }
            ClubError::IdCollision(_) => ApiError::Internal,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::Declined(m) => (StatusCode::FORBIDDEN, m.clone()),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            ApiError::Upstream(m) => (StatusCode::BAD_GATEWAY, m.clone()),
            ApiError::Busy(m) => (StatusCode::SERVICE_UNAVAILABLE, m.clone()),
            ApiError::Config(_) | ApiError::Internal => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };

        (status, Json(ErrorBody { error: msg })).into_response()
    }
}
