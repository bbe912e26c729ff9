//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use opentelemetry::metrics::Counter;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub service_name: Arc<str>,
    pub version: Arc<str>,
    /// Greetings served, by outcome.
    pub greetings: Counter<u64>,
}

impl AppState {
    /// Create the state; instruments come from the process-wide meter, so
    /// call this after telemetry is initialised.
    pub fn new(service_name: &str, version: &str) -> Self {
        let greetings = observability::meter(env!("CARGO_PKG_NAME"))
            .u64_counter("demo.greetings")
            .with_description("Greetings served")
            .init();
        Self {
            service_name: Arc::from(service_name),
            version: Arc::from(version),
            greetings,
        }
    }
}

impl Default for AppState {
    /// State backed by whatever meter is installed (a no-op in tests).
    fn default() -> Self {
        Self::new("demo-service", "dev")
    }
}
