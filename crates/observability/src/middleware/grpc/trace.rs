//! Server spans and call duration for gRPC.

use std::{
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use futures::FutureExt as _;
use http::{Request, Response};
use opentelemetry::{
    global,
    metrics::Histogram,
    trace::{FutureExt as _, SpanKind, Status, TraceContextExt, Tracer},
    Context as OtelContext, KeyValue,
};
use opentelemetry_semantic_conventions::trace::{
    RPC_GRPC_STATUS_CODE, RPC_METHOD, RPC_SERVICE, RPC_SYSTEM, SERVER_ADDRESS,
};
use tonic::Code;
use tower::{Layer, Service};

use super::body::{status_code, ObservedBody};
use crate::{
    middleware::{MiddlewareConfig, TraceSlot, INSTRUMENTATION_SCOPE},
    telemetry::propagation,
};

/// Opens a server span per call as a child of any incoming `traceparent`.
///
/// The span ends when the call's final status is known, so streaming calls
/// are covered end to end. Duration is recorded on `rpc.server.duration`
/// (milliseconds), bound to the meter provider installed when the layer is
/// built.
#[derive(Clone)]
pub struct GrpcTracingLayer {
    server_name: Arc<str>,
    config: Arc<MiddlewareConfig>,
    duration: Histogram<f64>,
}

impl GrpcTracingLayer {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self::with_config(server_name, MiddlewareConfig::default())
    }

    pub fn with_config(server_name: impl Into<String>, config: MiddlewareConfig) -> Self {
        Self::from_shared(server_name, Arc::new(config))
    }

    pub(crate) fn from_shared(server_name: impl Into<String>, config: Arc<MiddlewareConfig>) -> Self {
        let duration = global::meter(INSTRUMENTATION_SCOPE)
            .f64_histogram("rpc.server.duration")
            .with_description("Duration of inbound gRPC calls in milliseconds")
            .init();
        Self {
            server_name: Arc::from(server_name.into()),
            config,
            duration,
        }
    }
}

impl<S> Layer<S> for GrpcTracingLayer {
    type Service = GrpcTracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcTracingService {
            inner,
            server_name: self.server_name.clone(),
            config: self.config.clone(),
            duration: self.duration.clone(),
        }
    }
}

#[derive(Clone)]
pub struct GrpcTracingService<S> {
    inner: S,
    server_name: Arc<str>,
    config: Arc<MiddlewareConfig>,
    duration: Histogram<f64>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for GrpcTracingService<S>
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

        let path = req.uri().path().to_owned();
        if self.config.is_excluded(&path) {
            return Box::pin(async move {
                Ok(inner.call(req).await?.map(ObservedBody::passthrough))
            });
        }

        let (service, method) = split_full_method(&path);
        let rpc_attributes = vec![
            KeyValue::new(RPC_SYSTEM, "grpc"),
            KeyValue::new(RPC_SERVICE, service.to_owned()),
            KeyValue::new(RPC_METHOD, method.to_owned()),
        ];
        let mut span_attributes = rpc_attributes.clone();
        span_attributes.push(KeyValue::new(SERVER_ADDRESS, self.server_name.to_string()));

        let parent = propagation::extract_context(req.headers());
        let tracer = global::tracer(INSTRUMENTATION_SCOPE);
        let span = tracer
            .span_builder(path.trim_start_matches('/').to_owned())
            .with_kind(SpanKind::Server)
            .with_attributes(span_attributes)
            .start_with_context(&tracer, &parent);
        let cx = parent.with_span(span);
        TraceSlot::ensure(&mut req).record(&cx);

        let call = CallSpan {
            cx: cx.clone(),
            duration: self.duration.clone(),
            attributes: rpc_attributes,
            start: Instant::now(),
        };

        Box::pin(async move {
            let outcome = AssertUnwindSafe(
                async move { inner.call(req).await }.with_context(cx.clone()),
            )
            .catch_unwind()
            .await;
            match outcome {
                Ok(Ok(response)) => {
                    let code = status_code(response.headers());
                    Ok(response.map(|body| {
                        ObservedBody::new(body, code, Box::new(move |code| call.finish(code)))
                            .in_context(cx)
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

struct CallSpan {
    cx: OtelContext,
    duration: Histogram<f64>,
    attributes: Vec<KeyValue>,
    start: Instant,
}

impl CallSpan {
    fn finish(mut self, code: Code) {
        let status_attr = KeyValue::new(RPC_GRPC_STATUS_CODE, i64::from(code as i32));

        let span = self.cx.span();
        span.set_attribute(status_attr.clone());
        if is_server_error(code) {
            span.set_status(Status::error(format!("{code:?}")));
        }
        span.end();

        self.attributes.push(status_attr);
        self.duration
            .record(self.start.elapsed().as_secs_f64() * 1000.0, &self.attributes);
    }
}

/// `/pkg.Service/Method` into `("pkg.Service", "Method")`.
fn split_full_method(path: &str) -> (&str, &str) {
    path.trim_start_matches('/')
        .split_once('/')
        .unwrap_or((path.trim_start_matches('/'), ""))
}

/// Codes that indicate a fault on the server side of the call.
fn is_server_error(code: Code) -> bool {
    matches!(
        code,
        Code::Unknown
            | Code::DeadlineExceeded
            | Code::Unimplemented
            | Code::Internal
            | Code::Unavailable
            | Code::DataLoss
    )
}
