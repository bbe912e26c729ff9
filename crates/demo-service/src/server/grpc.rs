//! tonic server exposing `grpc.health.v1.Health` behind the gRPC pipeline.

use std::net::SocketAddr;

use observability::{GrpcObservabilityLayer, Logger, MiddlewareConfig};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic_health::ServingStatus;
use tracing::info;

/// Health checks are frequent; keep them out of logs and traces.
const HEALTH_WATCH: &str = "/grpc.health.v1.Health/Watch";
const HEALTH_CHECK: &str = "/grpc.health.v1.Health/Check";

/// Serve until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn serve(
    addr: SocketAddr,
    service_name: String,
    logger: Logger,
    shutdown: CancellationToken,
) -> Result<(), tonic::transport::Error> {
    let (mut reporter, health) = tonic_health::server::health_reporter();
    reporter
        .set_service_status(&service_name, ServingStatus::Serving)
        .await;
    reporter.set_service_status("", ServingStatus::Serving).await;

    let observability = GrpcObservabilityLayer::with_config(
        logger,
        service_name,
        MiddlewareConfig::new().with_excluded_paths([HEALTH_CHECK, HEALTH_WATCH]),
    );

    info!(addr = %addr, "gRPC listening");
    Server::builder()
        .layer(observability)
        .add_service(health)
        .serve_with_shutdown(addr, shutdown.cancelled_owned())
        .await
}
