//! One structured log line per HTTP request.

use std::{
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use axum::{
    http::{header, Request},
    response::Response,
};
use futures::FutureExt;
use tower::{Layer, Service};

use crate::{
    middleware::{MiddlewareConfig, TraceSlot},
    Logger,
};

/// Logs method, path, query, status, latency, client IP, user agent and
/// trace id once each request completes.
///
/// `5xx` is logged at error, `4xx` at warn, everything else at info.
#[derive(Clone, Debug)]
pub struct HttpLoggingLayer {
    logger: Logger,
    config: Arc<MiddlewareConfig>,
}

impl HttpLoggingLayer {
    pub fn new(logger: Logger) -> Self {
        Self::with_config(logger, MiddlewareConfig::default())
    }

    pub fn with_config(logger: Logger, config: MiddlewareConfig) -> Self {
        Self {
            logger,
            config: Arc::new(config),
        }
    }

    pub(crate) fn from_shared(logger: Logger, config: Arc<MiddlewareConfig>) -> Self {
        Self { logger, config }
    }
}

impl<S> Layer<S> for HttpLoggingLayer {
    type Service = HttpLoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpLoggingService {
            inner,
            logger: self.logger.clone(),
            config: self.config.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpLoggingService<S> {
    inner: S,
    logger: Logger,
    config: Arc<MiddlewareConfig>,
}

impl<S, B> Service<Request<B>> for HttpLoggingService<S>
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

        if self.config.is_excluded(req.uri().path()) {
            return Box::pin(inner.call(req));
        }

        let slot = TraceSlot::ensure(&mut req);
        let line = RequestLine::from_request(&req);
        let logger = self.logger.clone();
        let start = Instant::now();

        Box::pin(async move {
            let outcome = AssertUnwindSafe(async move { inner.call(req).await })
                .catch_unwind()
                .await;
            let latency = start.elapsed();
            match outcome {
                Ok(Ok(response)) => {
                    line.log(&logger, response.status().as_u16(), latency, &slot);
                    Ok(response)
                }
                Ok(Err(err)) => {
                    line.log(&logger, 500, latency, &slot);
                    Err(err)
                }
                Err(payload) => {
                    line.log(&logger, 500, latency, &slot);
                    panic::resume_unwind(payload)
                }
            }
        })
    }
}

struct RequestLine {
    method: String,
    path: String,
    query: String,
    client_ip: String,
    user_agent: String,
}

impl RequestLine {
    fn from_request<B>(req: &Request<B>) -> Self {
        let header_str = |name: header::HeaderName| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_owned()
        };
        let client_ip = header_str(header::HeaderName::from_static("x-forwarded-for"))
            .split(',')
            .next()
            .unwrap_or_default()
            .trim()
            .to_owned();

        Self {
            method: req.method().to_string(),
            path: req.uri().path().to_owned(),
            query: req.uri().query().unwrap_or_default().to_owned(),
            client_ip,
            user_agent: header_str(header::USER_AGENT),
        }
    }

    fn log(&self, logger: &Logger, status: u16, latency: Duration, slot: &TraceSlot) {
        let trace_id = slot.resolve();
        let trace_id = trace_id.as_deref();
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let method = self.method.as_str();
        let path = self.path.as_str();
        let query = self.query.as_str();
        let client_ip = self.client_ip.as_str();
        let user_agent = self.user_agent.as_str();

        logger.emit(|| match status {
            500..=u16::MAX => tracing::error!(
                method, path, query, status, latency_ms, client_ip, user_agent, trace_id,
                "HTTP request"
            ),
            400..=499 => tracing::warn!(
                method, path, query, status, latency_ms, client_ip, user_agent, trace_id,
                "HTTP request"
            ),
            _ => tracing::info!(
                method, path, query, status, latency_ms, client_ip, user_agent, trace_id,
                "HTTP request"
            ),
        });
    }
}
