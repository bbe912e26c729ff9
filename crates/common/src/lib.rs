//! Common types and errors shared across the observability workspace crates.

pub mod error;
pub mod protocol;

pub use error::ServiceError;
pub use protocol::ErrorResponse;
