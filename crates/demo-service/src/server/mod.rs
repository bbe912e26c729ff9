//! HTTP and gRPC servers.
//!
//! # Responsibilities
//! - Define the Axum router with all routes and shared middleware.
//! - Serve the standard gRPC health service behind the gRPC pipeline.
//! - Stop both listeners when the shutdown token is cancelled.

pub mod grpc;
pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;
