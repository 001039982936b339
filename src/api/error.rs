//! API error type and response formatting.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::{info, warn};

use super::types::ApiResponse;

/// Result type for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    /// Body was not valid JSON or missed a required field
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Runway(#[from] crate::error::Error),
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

/// Errors become a failed envelope with HTTP 200.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::BadRequest(_) => info!(error = %self, "Rejected request"),
            ApiError::Runway(e) if e.is_validation() => info!(error = %self, "Rejected request"),
            ApiError::Runway(_) => warn!(error = %self, "Request failed"),
        }
        (StatusCode::OK, Json(ApiResponse::failed(self.to_string()))).into_response()
    }
}
