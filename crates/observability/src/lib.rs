//! Observability bootstrap for axum and tonic services.
//!
//! A service calls [`init_telemetry`] once at startup with validated
//! [`Settings`]. That wires up span export over OTLP, metrics export (scrape
//! endpoint, periodic OTLP push, or both) and W3C trace-context propagation,
//! and returns a [`TelemetryHandle`] whose
//! [`shutdown`](TelemetryHandle::shutdown) flushes and stops everything in
//! order.
//!
//! Inbound requests are instrumented by the tower layers in [`middleware`]:
//! panic recovery, structured request logging and server spans, for both
//! HTTP (axum) and gRPC (tonic).

pub mod config;
pub mod logger;
pub mod metadata;
pub mod middleware;
pub mod telemetry;

pub use config::{ConfigError, MetricsMode, PushProtocol, Settings};
pub use logger::{LogSink, Logger, LoggerBuilder};
pub use metadata::BuildInfo;
pub use middleware::{
    grpc::GrpcObservabilityLayer, http::HttpObservabilityLayer, MiddlewareConfig,
};
pub use telemetry::{
    current_trace_id, init_telemetry, meter, tracer, ShutdownError, TelemetryError,
    TelemetryHandle,
};
