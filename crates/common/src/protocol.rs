//! Response bodies exchanged with API consumers.
//!
//! These types are serialised as JSON by the HTTP surface. Field order is part
//! of the wire contract: `ErrorResponse` always renders as
//! `{"error":..,"message":..,"path":..,"trace_id":..}`.

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Error body returned when a request fails, including recovered panics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Generic error class (e.g. `"Internal Server Error"`).
    pub error: String,
    /// Human-readable detail.
    pub message: String,
    /// Request path the error was produced for.
    pub path: String,
    /// 32-hex trace identifier, or empty when no trace context was active.
    pub trace_id: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from its four fields.
    pub fn new(
        error: impl Into<String>,
        message: impl Into<String>,
        path: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            path: path.into(),
            trace_id: trace_id.into(),
        }
    }

    /// Build the consumer-facing body for a [`ServiceError`].
    pub fn from_error(
        err: &ServiceError,
        path: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self::new(err.public_error(), err.detail(), path, trace_id)
    }
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: String,
    /// Service name from build metadata or configuration.
    pub service: String,
    /// Service version.
    pub version: String,
}
