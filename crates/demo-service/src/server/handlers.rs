//! Axum request handlers for the demo endpoints.

use axum::{
    extract::{Path, State},
    http::{StatusCode, Uri},
    response::IntoResponse,
    Json,
};
use common::{protocol::HealthResponse, ErrorResponse};
use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::info;

use super::state::AppState;

#[derive(Debug, Serialize)]
pub struct Greeting {
    pub message: String,
    pub trace_id: String,
}

/// `GET /health`: liveness check, excluded from instrumentation.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        service: state.service_name.to_string(),
        version: state.version.to_string(),
    })
}

/// `GET /greet/:name`
///
/// Returns the trace id of the request span so callers can look the request
/// up in their tracing backend.
pub async fn greet(
    State(state): State<AppState>,
    Path(name): Path<String>,
    uri: Uri,
) -> impl IntoResponse {
    let name = name.trim();
    if name.is_empty() {
        state.greetings.add(1, &[KeyValue::new("outcome", "rejected")]);
        let err = common::ServiceError::BadRequest("name must not be empty".into());
        let body = ErrorResponse::from_error(&err, uri.path(), trace_id());
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    }

    state.greetings.add(1, &[KeyValue::new("outcome", "ok")]);
    info!(name, "greeting");
    Json(Greeting {
        message: format!("hello, {name}"),
        trace_id: trace_id(),
    })
    .into_response()
}

/// `GET /panic`: fails on purpose to exercise panic recovery.
pub async fn explode() -> StatusCode {
    panic!("demo handler panicked")
}

/// Catch-all 404 handler.
pub async fn not_found(uri: Uri) -> impl IntoResponse {
    let err = ErrorResponse::new(
        "Not Found",
        "the requested resource does not exist",
        uri.path(),
        trace_id(),
    );
    (StatusCode::NOT_FOUND, Json(err))
}

fn trace_id() -> String {
    observability::current_trace_id().unwrap_or_default()
}
