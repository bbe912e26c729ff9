//! Axum router construction.

use axum::{routing::get, Router};
use observability::Logger;
use tower_http::timeout::TimeoutLayer;

use super::{handlers, middleware, state::AppState};

/// Build the application [`Router`] with all routes and middleware attached.
pub fn build(state: AppState, logger: Logger) -> Router {
    let observability = middleware::observability(logger, &state.service_name);
    Router::new()
        .route("/health", get(handlers::health))
        .route("/greet/:name", get(handlers::greet))
        .route("/panic", get(handlers::explode))
        .fallback(handlers::not_found)
        .layer(TimeoutLayer::new(middleware::REQUEST_TIMEOUT))
        .layer(observability)
        .with_state(state)
}
