//! Axum middleware layers applied to the router.
//!
//! Observability (recovery, logging, tracing) wraps everything, with a
//! request timeout inside it.

use std::time::Duration;

use observability::{HttpObservabilityLayer, Logger, MiddlewareConfig};

/// Default per-request timeout applied to all routes.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Paths served without logs or spans.
pub const UNINSTRUMENTED_PATHS: [&str; 1] = ["/health"];

pub fn observability(logger: Logger, service_name: &str) -> HttpObservabilityLayer {
    HttpObservabilityLayer::with_config(
        logger,
        service_name,
        MiddlewareConfig::new().with_excluded_paths(UNINSTRUMENTED_PATHS),
    )
}
