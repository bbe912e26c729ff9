//! Server spans and request duration for HTTP.

use std::{
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use axum::{
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    response::Response,
};
use futures::FutureExt as _;
use opentelemetry::{
    global,
    metrics::Histogram,
    trace::{FutureExt as _, SpanKind, Status, TraceContextExt, Tracer},
    KeyValue,
};
use opentelemetry_semantic_conventions::trace::{
    HTTP_REQUEST_METHOD, HTTP_RESPONSE_STATUS_CODE, HTTP_ROUTE, SERVER_ADDRESS, URL_PATH,
};
use tower::{Layer, Service};

use crate::{
    middleware::{panic_message, MiddlewareConfig, TraceSlot, INSTRUMENTATION_SCOPE},
    telemetry::{propagation, trace_id_of},
};

/// Response header carrying the server span's trace id.
pub const TRACE_ID_HEADER: HeaderName = HeaderName::from_static("x-trace-id");

/// Opens a server span per request as a child of any incoming `traceparent`,
/// and records `http.server.request.duration`.
///
/// The duration histogram is bound to the meter provider installed when the
/// layer is built, so build it after telemetry is initialised.
#[derive(Clone)]
pub struct HttpTracingLayer {
    server_name: Arc<str>,
    config: Arc<MiddlewareConfig>,
    duration: Histogram<f64>,
}

impl HttpTracingLayer {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self::with_config(server_name, MiddlewareConfig::default())
    }

    pub fn with_config(server_name: impl Into<String>, config: MiddlewareConfig) -> Self {
        Self::from_shared(server_name, Arc::new(config))
    }

    pub(crate) fn from_shared(server_name: impl Into<String>, config: Arc<MiddlewareConfig>) -> Self {
        let duration = global::meter(INSTRUMENTATION_SCOPE)
            .f64_histogram("http.server.request.duration")
            .with_description("Duration of HTTP server requests in seconds")
            .init();
        Self {
            server_name: Arc::from(server_name.into()),
            config,
            duration,
        }
    }
}

impl<S> Layer<S> for HttpTracingLayer {
    type Service = HttpTracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpTracingService {
            inner,
            server_name: self.server_name.clone(),
            config: self.config.clone(),
            duration: self.duration.clone(),
        }
    }
}

#[derive(Clone)]
pub struct HttpTracingService<S> {
    inner: S,
    server_name: Arc<str>,
    config: Arc<MiddlewareConfig>,
    duration: Histogram<f64>,
}

impl<S, B> Service<Request<B>> for HttpTracingService<S>
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
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let path = req.uri().path().to_owned();
        if self.config.is_excluded(&path) {
            return Box::pin(inner.call(req));
        }

        let method = req.method().to_string();
        let route = req
            .extensions()
            .get::<MatchedPath>()
            .map(|m| m.as_str().to_owned());

        let mut attributes = vec![
            KeyValue::new(HTTP_REQUEST_METHOD, method.clone()),
            KeyValue::new(URL_PATH, path.clone()),
            KeyValue::new(SERVER_ADDRESS, self.server_name.to_string()),
        ];
        if let Some(route) = &route {
            attributes.push(KeyValue::new(HTTP_ROUTE, route.clone()));
        }

        let parent = propagation::extract_context(req.headers());
        let tracer = global::tracer(INSTRUMENTATION_SCOPE);
        let span = tracer
            .span_builder(span_name(&method, route.as_deref(), &path))
            .with_kind(SpanKind::Server)
            .with_attributes(attributes)
            .start_with_context(&tracer, &parent);
        let cx = parent.with_span(span);
        TraceSlot::ensure(&mut req).record(&cx);

        let duration = self.duration.clone();
        let metric_route = route.unwrap_or(path);
        let start = Instant::now();

        Box::pin(async move {
            let outcome = AssertUnwindSafe(
                async move { inner.call(req).await }.with_context(cx.clone()),
            )
            .catch_unwind()
            .await;

            let span = cx.span();
            let status = match &outcome {
                Ok(Ok(response)) => response.status().as_u16(),
                _ => 500,
            };
            span.set_attribute(KeyValue::new(HTTP_RESPONSE_STATUS_CODE, i64::from(status)));
            match &outcome {
                Err(payload) => span.set_status(Status::error(panic_message(&**payload))),
                _ if status >= 500 => span.set_status(Status::error(format!("HTTP {status}"))),
                _ => {}
            }
            span.end();

            duration.record(
                start.elapsed().as_secs_f64(),
                &[
                    KeyValue::new(HTTP_REQUEST_METHOD, method),
                    KeyValue::new(HTTP_ROUTE, metric_route),
                    KeyValue::new(HTTP_RESPONSE_STATUS_CODE, i64::from(status)),
                ],
            );

            match outcome {
                Ok(Ok(mut response)) => {
                    if let Some(value) = trace_id_of(&cx).and_then(|id| HeaderValue::try_from(id).ok()) {
                        response.headers_mut().insert(TRACE_ID_HEADER, value);
                    }
                    Ok(response)
                }
                Ok(Err(err)) => Err(err),
                Err(payload) => panic::resume_unwind(payload),
            }
        })
    }
}

/// `METHOD route`, falling back to the raw path when no route matched.
fn span_name(method: &str, route: Option<&str>, path: &str) -> String {
    format!("{method} {}", route.unwrap_or(path))
}
