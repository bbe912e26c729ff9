//! HTTP (axum) instrumentation layers.

mod logging;
mod recovery;
mod trace;

use std::sync::Arc;

use tower::Layer;

pub use logging::{HttpLoggingLayer, HttpLoggingService};
pub use recovery::{HttpRecoveryLayer, HttpRecoveryService};
pub use trace::{HttpTracingLayer, HttpTracingService, TRACE_ID_HEADER};

use super::MiddlewareConfig;
use crate::Logger;

/// Recovery, logging and tracing in their standard order.
///
/// ```ignore
/// let app = Router::new()
///     .route("/users/:id", get(user))
///     .layer(HttpObservabilityLayer::with_config(
///         logger,
///         "users-api",
///         MiddlewareConfig::new().with_excluded_paths(["/health"]),
///     ));
/// ```
#[derive(Clone)]
pub struct HttpObservabilityLayer {
    recovery: HttpRecoveryLayer,
    logging: HttpLoggingLayer,
    tracing: HttpTracingLayer,
}

impl HttpObservabilityLayer {
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
            recovery: HttpRecoveryLayer::new(logger.clone()),
            logging: HttpLoggingLayer::from_shared(logger, config.clone()),
            tracing: HttpTracingLayer::from_shared(service_name, config),
        }
    }
}

impl<S> Layer<S> for HttpObservabilityLayer {
    type Service = HttpRecoveryService<HttpLoggingService<HttpTracingService<S>>>;

    fn layer(&self, inner: S) -> Self::Service {
        self.recovery
            .layer(self.logging.layer(self.tracing.layer(inner)))
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        routing::get,
        Router,
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::test_support::capture;

    async fn boom() -> &'static str {
        panic!("boom")
    }

    #[tokio::test]
    async fn full_pipeline_recovers_and_logs_once() {
        let (logger, logs) = capture("info");
        let app = Router::new()
            .route("/x", get(boom))
            .layer(HttpObservabilityLayer::new(logger, "unit-test"));

        let resp = app
            .oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body: common::ErrorResponse =
            serde_json::from_slice(&resp.into_body().collect().await.unwrap().to_bytes())
                .unwrap();
        assert_eq!(body.error, "Internal Server Error");
        assert_eq!(body.message, "boom");
        assert_eq!(body.path, "/x");
        assert_eq!(body.trace_id, "");

        let lines = logs.lines();
        assert_eq!(lines.iter().filter(|l| l["message"] == "HTTP request").count(), 1);
        assert_eq!(lines.iter().filter(|l| l["panic"] == "boom").count(), 1);
    }

    #[tokio::test]
    async fn excluded_path_is_still_recovered() {
        let (logger, logs) = capture("info");
        let app = Router::new().route("/health", get(boom)).layer(
            HttpObservabilityLayer::with_config(
                logger,
                "unit-test",
                MiddlewareConfig::new().with_excluded_paths(["/health"]),
            ),
        );

        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let lines = logs.lines();
        assert!(lines.iter().all(|l| l["message"] != "HTTP request"));
        assert_eq!(lines.len(), 1);
    }
}
