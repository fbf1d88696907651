//! Mapping of engine errors onto HTTP responses.

use crate::errors::Error;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{error, warn};

/// JSON body of every error response
#[derive(Debug, Serialize)]
pub struct JsonError {
    /// Human-readable message
    pub error: String,
}

/// An engine error on its way out of a handler
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

/// HTTP status for an engine error.
#[must_use]
pub const fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidInput { .. }
        | Error::InvalidCoordinate { .. }
        | Error::InvalidQuantity { .. }
        | Error::InvalidAmount { .. } => StatusCode::BAD_REQUEST,
        Error::ListingNotFound { .. }
        | Error::BusinessNotFound { .. }
        | Error::ReservationNotFound { .. } => StatusCode::NOT_FOUND,
        Error::InsufficientStock { .. }
        | Error::ListingExpired { .. }
        | Error::InvalidTransition { .. }
        | Error::DuplicateRequest { .. } => StatusCode::CONFLICT,
        Error::StorageUnavailable { .. } | Error::Timeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
        Error::Config { .. } | Error::Database(_) | Error::Io(_) | Error::EnvVar(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            warn!("Request rejected: {}", self.0);
        }
        (
            status,
            Json(JsonError {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}
