//! Panic recovery for HTTP handlers.

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use common::{ErrorResponse, ServiceError};
use futures::FutureExt;
use tower::{Layer, Service};

use crate::{
    middleware::{panic_message, TraceSlot},
    Logger,
};

/// Turns a panic anywhere below into a `500` JSON [`ErrorResponse`].
#[derive(Clone, Debug)]
pub struct HttpRecoveryLayer {
    logger: Logger,
}

impl HttpRecoveryLayer {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

impl<S> Layer<S> for HttpRecoveryLayer {
    type Service = HttpRecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpRecoveryService {
            inner,
            logger: self.logger.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpRecoveryService<S> {
    inner: S,
    logger: Logger,
}

impl<S, B> Service<Request<B>> for HttpRecoveryService<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let slot = TraceSlot::ensure(&mut req);
        let method = req.method().to_string();
        let path = req.uri().path().to_owned();
        let logger = self.logger.clone();

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match AssertUnwindSafe(async move { inner.call(req).await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => {
                    let err = ServiceError::Internal(panic_message(&*payload));
                    let trace_id = slot.resolve().unwrap_or_default();

                    logger.emit(|| {
                        tracing::error!(
                            method = method.as_str(),
                            path = path.as_str(),
                            panic = err.detail(),
                            trace_id = trace_id.as_str(),
                            "recovered from panic in HTTP handler"
                        )
                    });

                    let status = StatusCode::from_u16(err.http_status())
                        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                    let body = ErrorResponse::from_error(&err, path, trace_id);
                    Ok((status, Json(body)).into_response())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, routing::get, Router};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::test_support::capture;

    async fn boom() -> &'static str {
        panic!("boom")
    }

    #[tokio::test]
    async fn panic_becomes_500_json_body() {
        let (logger, logs) = capture("info");
        let app = Router::new()
            .route("/x", get(boom))
            .layer(HttpRecoveryLayer::new(logger));

        let resp = app
            .oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            std::str::from_utf8(&body).unwrap(),
            r#"{"error":"Internal Server Error","message":"boom","path":"/x","trace_id":""}"#
        );

        let lines = logs.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["level"], "ERROR");
        assert_eq!(lines[0]["panic"], "boom");
        assert_eq!(lines[0]["path"], "/x");
    }

    #[tokio::test]
    async fn normal_responses_pass_through_untouched() {
        let (logger, logs) = capture("info");
        let app = Router::new()
            .route("/ok", get(|| async { (StatusCode::CREATED, "made") }))
            .layer(HttpRecoveryLayer::new(logger));

        let resp = app
            .oneshot(Request::builder().uri("/ok").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"made");
        assert!(logs.lines().is_empty());
    }
}
