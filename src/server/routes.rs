//! HTTP routes.
//!
//! - POST /invoke, POST /generate: single-shot completion, `text/plain` body
//! - POST /stream: incremental completion, one raw text chunk per fragment
//! - GET /model: path of the loaded model
//! - GET /health
//! - GET /metrics
//!
//! Trailing-slash forms are accepted as well.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::error::ServiceError;
use crate::inference::facade::{LanguageModel, ModelResponse};
use crate::metrics::Metrics;
use crate::request::{ModelRequest, ModelRequestBody};
use crate::server::streaming::{text_chunks, StreamCounters, STREAM_CONTENT_TYPE};

/// Application state shared across handlers.
pub struct AppState {
    pub model: LanguageModel,
    pub config: Arc<Config>,
    pub metrics: Metrics,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(model: LanguageModel, config: Arc<Config>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            model,
            config,
            metrics: Metrics::new()?,
            start_time: Instant::now(),
        })
    }

    fn record_error(&self, err: &ServiceError) {
        self.metrics.errors.with_label_values(&[err.kind()]).inc();
    }

    /// Resolve and validate a request body. Rejected bodies never reach the
    /// model.
    fn parse_request(
        &self,
        payload: Result<Json<ModelRequestBody>, JsonRejection>,
        streaming: bool,
    ) -> Result<ModelRequest, ServiceError> {
        let Json(body) = payload?;
        let request =
            ModelRequest::from_body(body, &self.config.generation, self.model.family())?;
        Ok(request.with_streaming(streaming))
    }
}

/// Build the axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/invoke", post(invoke))
        .route("/invoke/", post(invoke))
        .route("/generate", post(invoke))
        .route("/generate/", post(invoke))
        .route("/stream", post(stream))
        .route("/stream/", post(stream))
        .route("/model", get(model_info))
        .route("/model/", get(model_info))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ─── Response Types ────────────────────────────────────────────────────────

/// Loaded model response.
#[derive(Debug, Serialize)]
pub struct ModelPathResponse {
    pub model_path: String,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub model_family: String,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn invoke(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ModelRequestBody>, JsonRejection>,
) -> Result<String, ServiceError> {
    state.metrics.requests.with_label_values(&["invoke"]).inc();
    run_invoke(&state, payload)
        .await
        .inspect_err(|e| state.record_error(e))
}

async fn run_invoke(
    state: &AppState,
    payload: Result<Json<ModelRequestBody>, JsonRejection>,
) -> Result<String, ServiceError> {
    let request = state.parse_request(payload, false)?;
    let request_id = Uuid::new_v4();

    info!(
        request_id = %request_id,
        prompt_len = request.prompt.len(),
        max_new_tokens = request.max_new_tokens,
        temperature = request.temperature,
        "Invoke request"
    );

    let timeout = state.config.server.request_timeout();
    let timer = state
        .metrics
        .inference_seconds
        .with_label_values(&["invoke"])
        .start_timer();
    let text = tokio::time::timeout(timeout, state.model.invoke(&request))
        .await
        .map_err(|_| ServiceError::Timeout(timeout.as_secs()))??;
    timer.observe_duration();

    info!(request_id = %request_id, chars = text.len(), "Invoke complete");
    Ok(text)
}

async fn stream(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ModelRequestBody>, JsonRejection>,
) -> Result<Response, ServiceError> {
    state.metrics.requests.with_label_values(&["stream"]).inc();
    run_stream(&state, payload)
        .await
        .inspect_err(|e| state.record_error(e))
}

async fn run_stream(
    state: &AppState,
    payload: Result<Json<ModelRequestBody>, JsonRejection>,
) -> Result<Response, ServiceError> {
    let request = state.parse_request(payload, true)?;
    let request_id = Uuid::new_v4();

    info!(
        request_id = %request_id,
        prompt_len = request.prompt.len(),
        max_new_tokens = request.max_new_tokens,
        temperature = request.temperature,
        "Stream request"
    );

    let timeout = state.config.server.request_timeout();
    let response = tokio::time::timeout(timeout, state.model.get_response(&request))
        .await
        .map_err(|_| ServiceError::Timeout(timeout.as_secs()))??;

    let ModelResponse::Stream(events) = response else {
        return Err(ServiceError::MalformedResponse(
            "expected a completion stream".into(),
        ));
    };

    // Headers go out only once the first fragment is in hand.
    let counters = StreamCounters {
        fragments: state.metrics.fragments.clone(),
        errors: state.metrics.errors.clone(),
    };
    let timer = state
        .metrics
        .inference_seconds
        .with_label_values(&["stream"])
        .start_timer();
    let chunks = text_chunks(events, request_id, timeout, counters).await?;
    timer.observe_duration();

    Ok((
        [
            (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(chunks),
    )
        .into_response())
}

async fn model_info(State(state): State<Arc<AppState>>) -> Json<ModelPathResponse> {
    state.metrics.requests.with_label_values(&["model"]).inc();
    Json(ModelPathResponse {
        model_path: state.model.model_path().to_string(),
    })
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        model_family: state.model.family().to_string(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(text) => text.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
