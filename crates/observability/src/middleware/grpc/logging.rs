//! One structured log line per gRPC call.

use std::{
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use futures::FutureExt;
use http::{Request, Response};
use tonic::Code;
use tower::{Layer, Service};
use tracing::Level;

use super::body::{status_code, ObservedBody};
use crate::{
    middleware::{MiddlewareConfig, TraceSlot},
    Logger,
};

/// Logs method, code, latency and trace id when each call completes.
///
/// A call completes when its final status is known, which for streaming
/// responses is after the last message has been sent.
#[derive(Clone, Debug)]
pub struct GrpcLoggingLayer {
    logger: Logger,
    config: Arc<MiddlewareConfig>,
}

impl GrpcLoggingLayer {
    pub fn new(logger: Logger) -> Self {
        Self::with_config(logger, MiddlewareConfig::default())
    }

    pub fn with_config(logger: Logger, config: MiddlewareConfig) -> Self {
        Self::from_shared(logger, Arc::new(config))
    }

    pub(crate) fn from_shared(logger: Logger, config: Arc<MiddlewareConfig>) -> Self {
        Self { logger, config }
    }
}

impl<S> Layer<S> for GrpcLoggingLayer {
    type Service = GrpcLoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcLoggingService {
            inner,
            logger: self.logger.clone(),
            config: self.config.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct GrpcLoggingService<S> {
    inner: S,
    logger: Logger,
    config: Arc<MiddlewareConfig>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for GrpcLoggingService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = Response<ObservedBody<ResBody>>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let method = req.uri().path().to_owned();
        if self.config.is_excluded(&method) {
            return Box::pin(async move {
                Ok(inner.call(req).await?.map(ObservedBody::passthrough))
            });
        }

        let call = CallLog {
            logger: self.logger.clone(),
            slot: TraceSlot::ensure(&mut req),
            method,
            start: Instant::now(),
        };

        Box::pin(async move {
            match AssertUnwindSafe(async move { inner.call(req).await })
                .catch_unwind()
                .await
            {
                Ok(Ok(response)) => {
                    let code = status_code(response.headers());
                    Ok(response.map(|body| {
                        ObservedBody::new(body, code, Box::new(move |code| call.finish(code)))
                    }))
                }
                Ok(Err(err)) => {
                    call.finish(Code::Unknown);
                    Err(err)
                }
                Err(payload) => {
                    call.finish(Code::Internal);
                    panic::resume_unwind(payload)
                }
            }
        })
    }
}

struct CallLog {
    logger: Logger,
    slot: TraceSlot,
    method: String,
    start: Instant,
}

impl CallLog {
    fn finish(self, code: Code) {
        let latency_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        let trace_id = self.slot.resolve();
        let trace_id = trace_id.as_deref();
        let method = self.method.as_str();

        let level = level_for(code);
        self.logger.emit(|| {
            if level == Level::ERROR {
                tracing::error!(method, code = ?code, latency_ms, trace_id, "gRPC call")
            } else if level == Level::WARN {
                tracing::warn!(method, code = ?code, latency_ms, trace_id, "gRPC call")
            } else {
                tracing::info!(method, code = ?code, latency_ms, trace_id, "gRPC call")
            }
        });
    }
}

/// Client-caused outcomes are warnings; server faults are errors.
fn level_for(code: Code) -> Level {
    match code {
        Code::Ok => Level::INFO,
        Code::NotFound
        | Code::InvalidArgument
        | Code::FailedPrecondition
        | Code::AlreadyExists
        | Code::DeadlineExceeded
        | Code::Cancelled
        | Code::Unauthenticated
        | Code::PermissionDenied => Level::WARN,
        _ => Level::ERROR,
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use bytes::Bytes;
    use http::HeaderMap;
    use http_body_util::{BodyExt, Full, StreamBody};
    use tonic::Status;
    use tower::{service_fn, ServiceExt};

    use super::*;
    use crate::test_support::capture;

    type TestBody = http_body_util::combinators::UnsyncBoxBody<Bytes, Infallible>;

    fn grpc_request(method: &str) -> Request<()> {
        Request::builder().uri(method).body(()).unwrap()
    }

    async fn unary_ok(_req: Request<()>) -> Result<Response<TestBody>, Infallible> {
        let mut trailers = HeaderMap::new();
        Status::new(Code::Ok, "").add_header(&mut trailers).unwrap();
        let frames = vec![
            Ok(http_body::Frame::data(Bytes::from_static(b"reply"))),
            Ok(http_body::Frame::trailers(trailers)),
        ];
        Ok(Response::new(
            StreamBody::new(futures::stream::iter(frames)).boxed_unsync(),
        ))
    }

    async fn not_found(_req: Request<()>) -> Result<Response<TestBody>, Infallible> {
        let mut response = Response::new(Full::new(Bytes::new()).boxed_unsync());
        Status::not_found("no such user")
            .add_header(response.headers_mut())
            .unwrap();
        Ok(response)
    }

    #[test]
    fn level_follows_status_severity() {
        assert_eq!(level_for(Code::Ok), Level::INFO);
        assert_eq!(level_for(Code::NotFound), Level::WARN);
        assert_eq!(level_for(Code::Unauthenticated), Level::WARN);
        assert_eq!(level_for(Code::Internal), Level::ERROR);
        assert_eq!(level_for(Code::Unavailable), Level::ERROR);
    }

    #[tokio::test]
    async fn unary_call_is_logged_when_trailers_arrive() {
        let (logger, logs) = capture("info");
        let svc = GrpcLoggingLayer::new(logger).layer(service_fn(unary_ok));

        let response = svc.oneshot(grpc_request("/users.v1.Users/Get")).await.unwrap();
        assert!(logs.lines().is_empty(), "nothing logged before the body ends");

        response.into_body().collect().await.unwrap();
        let lines = logs.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["method"], "/users.v1.Users/Get");
        assert_eq!(lines[0]["code"], "Ok");
        assert_eq!(lines[0]["level"], "INFO");
    }

    #[tokio::test]
    async fn trailers_only_error_is_logged_immediately_as_warning() {
        let (logger, logs) = capture("info");
        let svc = GrpcLoggingLayer::new(logger).layer(service_fn(not_found));

        let _response = svc.oneshot(grpc_request("/users.v1.Users/Get")).await.unwrap();
        let lines = logs.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["code"], "NotFound");
        assert_eq!(lines[0]["level"], "WARN");
    }

    #[tokio::test]
    async fn excluded_methods_are_not_logged() {
        let (logger, logs) = capture("info");
        let config = MiddlewareConfig::new().with_excluded_paths(["/grpc.health.v1.Health/Check"]);
        let svc = GrpcLoggingLayer::with_config(logger, config).layer(service_fn(unary_ok));

        let response = svc
            .oneshot(grpc_request("/grpc.health.v1.Health/Check"))
            .await
            .unwrap();
        response.into_body().collect().await.unwrap();
        assert!(logs.lines().is_empty());
    }
}
