//! Service-level errors and their HTTP mapping.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::inference::completion::EngineError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("model failed to load: {0}")]
    ModelLoad(String),

    #[error("inference failed: {0}")]
    Inference(#[from] EngineError),

    #[error("malformed completion: {0}")]
    MalformedResponse(String),

    #[error("stream interrupted after {delivered} fragments")]
    StreamInterrupted { delivered: usize },

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("model worker is not running")]
    WorkerUnavailable,
}

impl ServiceError {
    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation",
            ServiceError::ModelLoad(_) => "model_load",
            ServiceError::Inference(_) => "inference",
            ServiceError::MalformedResponse(_) => "malformed_response",
            ServiceError::StreamInterrupted { .. } => "stream_interrupted",
            ServiceError::Timeout(_) => "timeout",
            ServiceError::WorkerUnavailable => "worker_unavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::MalformedResponse(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::WorkerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::ModelLoad(_)
            | ServiceError::Inference(_)
            | ServiceError::StreamInterrupted { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        ServiceError::Validation(rejection.body_text())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (self.status(), Json(body)).into_response()
    }
}
