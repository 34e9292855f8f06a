use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;

/// Request-level errors. Everything that can go wrong after the process
/// has started serving traffic.
#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no translator named '{0}' is configured")]
    InvalidBackendSelection(String),

    /// Queue saturated or queue wait exceeded before dispatch.
    #[error("translator '{0}' is overloaded")]
    Overloaded(String),

    /// Overall request deadline exceeded while the call was in flight.
    #[error("translation deadline exceeded on '{0}'")]
    Timeout(String),

    /// Remote backend did not answer within its per-attempt timeout,
    /// retries (if any) exhausted.
    #[error("backend '{0}' timed out")]
    BackendTimeout(String),

    /// Backend previously failed fatally and is marked out of service.
    #[error("backend '{backend}' is unavailable: {cause}")]
    BackendUnavailable { backend: String, cause: String },

    /// Backend returned a non-retryable failure for this request.
    #[error("backend '{backend}' failed: {cause}")]
    Backend { backend: String, cause: String },
}

impl TranslateError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TranslateError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            TranslateError::InvalidBackendSelection(_) => StatusCode::NOT_FOUND,
            TranslateError::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            TranslateError::Timeout(_) | TranslateError::BackendTimeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            TranslateError::BackendUnavailable { .. } | TranslateError::Backend { .. } => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    /// Stable code for boundary-layer clients.
    pub fn code(&self) -> &'static str {
        match self {
            TranslateError::InvalidInput(_) => "invalid_input",
            TranslateError::InvalidBackendSelection(_) => "invalid_backend_selection",
            TranslateError::Overloaded(_) => "overloaded",
            TranslateError::Timeout(_) => "timeout",
            TranslateError::BackendTimeout(_) => "backend_timeout",
            TranslateError::BackendUnavailable { .. } => "backend_unavailable",
            TranslateError::Backend { .. } => "backend_error",
        }
    }
}

impl IntoResponse for TranslateError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.code(),
            "detail": self.to_string(),
        }));
        (self.status_code(), body).into_response()
    }
}

/// Fatal startup errors. Any of these refuses process start; none of them
/// is ever surfaced lazily on a per-request basis.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("failed to load model from {path}: {cause}")]
    ModelLoad { path: PathBuf, cause: String },

    #[error("requested device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("LLM endpoint '{endpoint}' unreachable: {cause}")]
    EndpointUnreachable { endpoint: String, cause: String },
}
