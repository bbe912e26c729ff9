//! Panic recovery for gRPC services.

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    task::{Context, Poll},
};

use common::ServiceError;
use futures::FutureExt;
use http::{header, HeaderValue, Request, Response};
use tonic::{Code, Status};
use tower::{Layer, Service};

use super::body::RecoveryBody;
use crate::{
    middleware::{panic_message, TraceSlot},
    Logger,
};

/// Turns a panic below into an `Internal` status.
///
/// A panic before the response exists yields a trailers-only response. A
/// panic while the response stream is being polled ends the stream with
/// `Internal` trailers.
#[derive(Clone, Debug)]
pub struct GrpcRecoveryLayer {
    logger: Logger,
}

impl GrpcRecoveryLayer {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

impl<S> Layer<S> for GrpcRecoveryLayer {
    type Service = GrpcRecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcRecoveryService {
            inner,
            logger: self.logger.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct GrpcRecoveryService<S> {
    inner: S,
    logger: Logger,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for GrpcRecoveryService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = Response<RecoveryBody<ResBody>>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let reporter = PanicReporter {
            logger: self.logger.clone(),
            slot: TraceSlot::ensure(&mut req),
            method: req.uri().path().to_owned(),
        };

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match AssertUnwindSafe(async move { inner.call(req).await })
                .catch_unwind()
                .await
            {
                Ok(Ok(response)) => Ok(response.map(|body| {
                    RecoveryBody::new(body, Box::new(move |message| reporter.report(message)))
                })),
                Ok(Err(err)) => Err(err),
                Err(payload) => {
                    let status = reporter.report(panic_message(&*payload));
                    Ok(trailers_only(&status))
                }
            }
        })
    }
}

struct PanicReporter {
    logger: Logger,
    slot: TraceSlot,
    method: String,
}

impl PanicReporter {
    /// Log the panic and build the status sent to the client.
    fn report(self, message: String) -> Status {
        let err = ServiceError::Internal(message);
        let trace_id = self.slot.resolve();
        let trace_id = trace_id.as_deref();
        let method = self.method.as_str();

        self.logger.emit(|| {
            tracing::error!(
                method,
                panic = err.detail(),
                trace_id,
                "recovered from panic in gRPC handler"
            )
        });

        Status::new(Code::from_i32(err.grpc_code()), err.detail())
    }
}

/// A response carrying only a status, with no messages.
fn trailers_only<B>(status: &Status) -> Response<RecoveryBody<B>> {
    let mut response = Response::new(RecoveryBody::empty());
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    let _ = status.add_header(headers);
    response
}
