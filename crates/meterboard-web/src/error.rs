//! HTTP error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use meterboard_core::{CoreError, ErrorCategory};
use serde_json::json;
use tracing::{error, warn};

/// Error returned by node endpoints, rendered as `{"message": ...}`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    /// Overrides the body's `code` field (used for "Invalid data format")
    pub code: Option<u16>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// Body nodes could not decode; HTTP 400 carrying code 422
    pub fn invalid_data() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: "Invalid data format".to_string(),
            code: Some(422),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err.category() {
            ErrorCategory::NotFound => ApiError::new(StatusCode::NOT_FOUND, err.to_string()),
            ErrorCategory::MalformedInput => ApiError::invalid_data(),
            ErrorCategory::Ineligible => ApiError::new(StatusCode::FORBIDDEN, err.to_string()),
            ErrorCategory::Persistence => {
                warn!(error = %err, "Request failed on the ledger");
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "ledger unavailable")
            }
            ErrorCategory::Invariant | ErrorCategory::Config => {
                error!(error = %err, "Request hit an internal error");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        error!(error = %err, "Failed to encode response");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.code {
            Some(code) => json!({ "code": code, "message": self.message }),
            None => json!({ "message": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}

/// Run blocking ledger work off the async executor
pub async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> meterboard_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => {
            error!(error = %e, "Blocking task failed");
            Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
        }
    }
}
