//! Response body wrappers that observe how a gRPC call ends.
//!
//! A gRPC status arrives either in the response headers (trailers-only
//! responses) or in the trailers frame after the last message. Handlers have
//! usually returned long before that frame is polled, so the logging and
//! tracing stages finish their work from inside the body.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    task::{Context, Poll},
};

use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use opentelemetry::Context as OtelContext;
use tonic::{Code, Status};

/// Called exactly once with the final status of a call.
pub(crate) type OnComplete = Box<dyn FnOnce(Code) + Send>;

/// The `grpc-status` carried by `headers`, if any.
pub(crate) fn status_code(headers: &HeaderMap) -> Option<Code> {
    headers
        .get("grpc-status")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i32>().ok())
        .map(Code::from_i32)
}

// ---------------------------------------------------------------------------
// ObservedBody
// ---------------------------------------------------------------------------

/// Reports the call's final status when it becomes known.
///
/// - status in the response headers: reported immediately
/// - a trailers frame: its `grpc-status`, or `Unknown` if absent
/// - end of body with no trailers: `Unknown`
/// - dropped before the end: `Cancelled`
/// - panic while polling: `Internal`, then the panic continues
pub struct ObservedBody<B> {
    inner: B,
    on_complete: Option<OnComplete>,
    cx: Option<OtelContext>,
}

impl<B> ObservedBody<B> {
    pub(crate) fn new(inner: B, header_code: Option<Code>, on_complete: OnComplete) -> Self {
        let mut body = Self {
            inner,
            on_complete: Some(on_complete),
            cx: None,
        };
        if let Some(code) = header_code {
            body.complete(code);
        }
        body
    }

    /// Wraps `inner` without observing it.
    pub(crate) fn passthrough(inner: B) -> Self {
        Self {
            inner,
            on_complete: None,
            cx: None,
        }
    }

    /// Poll the inner body with `cx` attached as the current context.
    pub(crate) fn in_context(mut self, cx: OtelContext) -> Self {
        self.cx = Some(cx);
        self
    }

    fn complete(&mut self, code: Code) {
        if let Some(f) = self.on_complete.take() {
            f(code);
        }
    }
}

impl<B> Body for ObservedBody<B>
where
    B: Body + Unpin,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let _guard = this.cx.clone().map(OtelContext::attach);
        if this.on_complete.is_none() {
            return Pin::new(&mut this.inner).poll_frame(cx);
        }

        let polled = match panic::catch_unwind(AssertUnwindSafe(|| {
            Pin::new(&mut this.inner).poll_frame(cx)
        })) {
            Ok(polled) => polled,
            Err(payload) => {
                this.complete(Code::Internal);
                panic::resume_unwind(payload)
            }
        };

        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(trailers) = frame.trailers_ref() {
                    this.complete(status_code(trailers).unwrap_or(Code::Unknown));
                }
            }
            Poll::Ready(Some(Err(_))) => this.complete(Code::Internal),
            Poll::Ready(None) => this.complete(Code::Unknown),
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for ObservedBody<B> {
    fn drop(&mut self) {
        self.complete(Code::Cancelled);
    }
}

impl<B> fmt::Debug for ObservedBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservedBody")
            .field("completed", &self.on_complete.is_none())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// RecoveryBody
// ---------------------------------------------------------------------------

/// Converts a panic while polling the response stream into `Internal`
/// trailers.
pub struct RecoveryBody<B> {
    inner: Option<B>,
    on_panic: Option<Box<dyn FnOnce(String) -> Status + Send>>,
}

impl<B> RecoveryBody<B> {
    pub(crate) fn new(inner: B, on_panic: Box<dyn FnOnce(String) -> Status + Send>) -> Self {
        Self {
            inner: Some(inner),
            on_panic: Some(on_panic),
        }
    }

    /// A body with no frames, for trailers-only responses.
    pub(crate) fn empty() -> Self {
        Self {
            inner: None,
            on_panic: None,
        }
    }
}

impl<B> Body for RecoveryBody<B>
where
    B: Body + Unpin,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match panic::catch_unwind(AssertUnwindSafe(|| Pin::new(inner).poll_frame(cx))) {
            Ok(polled) => polled,
            Err(payload) => {
                // The inner body is in an unknown state after a panic.
                this.inner = None;
                let message = crate::middleware::panic_message(&*payload);
                let status = match this.on_panic.take() {
                    Some(on_panic) => on_panic(message),
                    None => Status::internal(message),
                };
                let mut trailers = HeaderMap::new();
                match status.add_header(&mut trailers) {
                    Ok(()) => Poll::Ready(Some(Ok(Frame::trailers(trailers)))),
                    Err(_) => Poll::Ready(None),
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.as_ref().map_or(true, Body::is_end_stream)
    }

    fn size_hint(&self) -> SizeHint {
        match &self.inner {
            Some(inner) => inner.size_hint(),
            None => SizeHint::with_exact(0),
        }
    }
}

impl<B> fmt::Debug for RecoveryBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryBody")
            .field("finished", &self.inner.is_none())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        convert::Infallible,
        sync::{Arc, Mutex},
    };

    use bytes::Bytes;
    use http_body_util::{BodyExt, Full, StreamBody};

    use super::*;

    fn recorder() -> (OnComplete, Arc<Mutex<Vec<Code>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (Box::new(move |code| sink.lock().unwrap().push(code)), seen)
    }

    fn trailers(code: Code) -> HeaderMap {
        let mut map = HeaderMap::new();
        Status::new(code, "").add_header(&mut map).unwrap();
        map
    }

    fn stream(
        frames: Vec<Frame<Bytes>>,
    ) -> StreamBody<futures::stream::Iter<std::vec::IntoIter<Result<Frame<Bytes>, Infallible>>>>
    {
        StreamBody::new(futures::stream::iter(
            frames.into_iter().map(Ok).collect::<Vec<_>>(),
        ))
    }

    #[test]
    fn status_code_reads_grpc_status_header() {
        assert_eq!(status_code(&trailers(Code::NotFound)), Some(Code::NotFound));
        assert_eq!(status_code(&HeaderMap::new()), None);
    }

    #[test]
    fn header_status_completes_immediately() {
        let (on_complete, seen) = recorder();
        let body = ObservedBody::new(Full::new(Bytes::new()), Some(Code::PermissionDenied), on_complete);
        assert_eq!(*seen.lock().unwrap(), vec![Code::PermissionDenied]);
        drop(body);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn trailers_frame_reports_its_status_once() {
        let (on_complete, seen) = recorder();
        let body = ObservedBody::new(
            stream(vec![
                Frame::data(Bytes::from_static(b"msg")),
                Frame::trailers(trailers(Code::Ok)),
            ]),
            None,
            on_complete,
        );

        let collected = body.collect().await.unwrap();
        assert_eq!(status_code(collected.trailers().unwrap()), Some(Code::Ok));
        assert_eq!(*seen.lock().unwrap(), vec![Code::Ok]);
    }

    #[tokio::test]
    async fn end_without_trailers_is_unknown() {
        let (on_complete, seen) = recorder();
        let body = ObservedBody::new(stream(vec![Frame::data(Bytes::from_static(b"x"))]), None, on_complete);
        body.collect().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Code::Unknown]);
    }

    #[test]
    fn dropped_body_is_cancelled() {
        let (on_complete, seen) = recorder();
        drop(ObservedBody::new(Full::new(Bytes::new()), None, on_complete));
        assert_eq!(*seen.lock().unwrap(), vec![Code::Cancelled]);
    }

    #[tokio::test]
    async fn recovery_body_turns_stream_panic_into_internal_trailers() {
        let panicking = StreamBody::new(futures::stream::poll_fn(
            |_| -> Poll<Option<Result<Frame<Bytes>, Infallible>>> { panic!("stream panic!") },
        ));
        let (on_complete, seen) = recorder();
        let observed = ObservedBody::new(panicking, None, on_complete);
        let body = RecoveryBody::new(observed, Box::new(|m: String| Status::internal(m)));

        let collected = body.collect().await.unwrap();
        let trailers = collected.trailers().unwrap();
        assert_eq!(status_code(trailers), Some(Code::Internal));
        assert_eq!(Status::from_header_map(trailers).unwrap().message(), "stream panic!");
        assert_eq!(*seen.lock().unwrap(), vec![Code::Internal]);
    }

    #[tokio::test]
    async fn empty_recovery_body_ends_immediately() {
        let body = RecoveryBody::<Full<Bytes>>::empty();
        assert!(body.is_end_stream());
        let collected = body.collect().await.unwrap();
        assert!(collected.to_bytes().is_empty());
    }
}
