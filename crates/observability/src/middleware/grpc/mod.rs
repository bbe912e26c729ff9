//! gRPC (tonic) instrumentation layers.
//!
//! The layers wrap the `http` service tonic builds, so they are registered with
//! `tonic::transport::Server::builder().layer(..)` and see every call,
//! unary or streaming.

mod body;
mod logging;
mod recovery;
mod trace;

use std::sync::Arc;

use tower::Layer;

pub use body::{ObservedBody, RecoveryBody};
pub use logging::{GrpcLoggingLayer, GrpcLoggingService};
pub use recovery::{GrpcRecoveryLayer, GrpcRecoveryService};
pub use trace::{GrpcTracingLayer, GrpcTracingService};

use super::MiddlewareConfig;
use crate::Logger;

/// Recovery, logging and tracing in their standard order.
#[derive(Clone)]
pub struct GrpcObservabilityLayer {
    recovery: GrpcRecoveryLayer,
    logging: GrpcLoggingLayer,
    tracing: GrpcTracingLayer,
}

impl GrpcObservabilityLayer {
    pub fn new(logger: Logger, service_name: impl Into<String>) -> Self {
        Self::with_config(logger, service_name, MiddlewareConfig::default())
    }

    pub fn with_config(
        logger: Logger,
        service_name: impl Into<String>,
        config: MiddlewareConfig,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            recovery: GrpcRecoveryLayer::new(logger.clone()),
            logging: GrpcLoggingLayer::from_shared(logger, config.clone()),
            tracing: GrpcTracingLayer::from_shared(service_name, config),
        }
    }
}

impl<S> Layer<S> for GrpcObservabilityLayer {
    type Service = GrpcRecoveryService<GrpcLoggingService<GrpcTracingService<S>>>;

    fn layer(&self, inner: S) -> Self::Service {
        self.recovery.layer(self.logging.layer(self.tracing.layer(inner)))
    }
}
