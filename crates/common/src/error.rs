//! Request-fault taxonomy shared by the HTTP and gRPC surfaces.

use thiserror::Error;

/// gRPC `INVALID_ARGUMENT` status code.
pub const GRPC_INVALID_ARGUMENT: i32 = 3;
/// gRPC `INTERNAL` status code.
pub const GRPC_INTERNAL: i32 = 13;

/// Error raised while serving a single request or call.
///
/// Variants map to both transport outcomes:
/// - [`ServiceError::BadRequest`] → HTTP 400 / gRPC `INVALID_ARGUMENT`
/// - [`ServiceError::Internal`] → HTTP 500 / gRPC `INTERNAL`
///
/// The payload is operator-facing detail. Callers only ever see it in the
/// `message` field; the generic [`ServiceError::public_error`] text is what
/// goes into the `error` field.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request was malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// An unexpected internal failure, including a recovered handler panic.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Returns the HTTP status code that should be sent for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            ServiceError::BadRequest(_) => 400,
            ServiceError::Internal(_) => 500,
        }
    }

    /// Returns the numeric gRPC status code for this error.
    pub fn grpc_code(&self) -> i32 {
        match self {
            ServiceError::BadRequest(_) => GRPC_INVALID_ARGUMENT,
            ServiceError::Internal(_) => GRPC_INTERNAL,
        }
    }

    /// Generic, stable error text safe to expose to API consumers.
    pub fn public_error(&self) -> &'static str {
        match self {
            ServiceError::BadRequest(_) => "Bad Request",
            ServiceError::Internal(_) => "Internal Server Error",
        }
    }

    /// The detail carried by this error, without the variant prefix.
    pub fn detail(&self) -> &str {
        match self {
            ServiceError::BadRequest(m) | ServiceError::Internal(m) => m,
        }
    }
}
