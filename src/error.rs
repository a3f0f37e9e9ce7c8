//! Error surface shared by the HTTP layer and the orchestrator.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::pool::PoolError;

/// Errors that surface to the HTTP caller at accept time. Everything after
/// accept propagates over SSE and callbacks only.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    InvalidParameter(String),

    #[error("unsupported format '{given}'; supported formats: {supported}")]
    UnsupportedFormat { given: String, supported: String },

    #[error("missing file field '{0}'")]
    MissingFile(&'static str),

    #[error("malformed callbacks field: {0}")]
    BadCallbacks(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("optimization queue is saturated, try again later")]
    QueueSaturated,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidParameter(_)
            | ApiError::UnsupportedFormat { .. }
            | ApiError::MissingFile(_)
            | ApiError::BadCallbacks(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::QueueSaturated => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Saturated => ApiError::QueueSaturated,
            PoolError::ShutDown => ApiError::Internal("worker pool is shut down".to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "statusCode": status.as_u16(),
            "error": status.canonical_reason().unwrap_or("Error"),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_4xx() {
        assert_eq!(
            ApiError::InvalidParameter("width out of range".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound("ctx".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::QueueSaturated.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn pool_saturation_becomes_503() {
        let err: ApiError = PoolError::Saturated.into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
