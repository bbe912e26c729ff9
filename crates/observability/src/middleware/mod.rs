//! Request instrumentation for axum (HTTP) and tonic (gRPC) services.
//!
//! Each protocol has three tower layers, composed outermost first:
//!
//! 1. **recovery** turns a panic in anything below it into a well-formed
//!    error response and logs it with the request's trace id.
//! 2. **logging** writes one structured line per request once the outcome is
//!    known.
//! 3. **tracing** continues the caller's trace (W3C `traceparent`), opens a
//!    server span and records request duration.
//!
//! Logging and tracing observe a panic, record it as a server error and
//! re-raise it, so recovery stays the only stage that swallows panics.

use std::{
    any::Any,
    collections::HashSet,
    fmt,
    sync::{Arc, OnceLock},
};

use opentelemetry::Context;

use crate::telemetry::trace_id_of;

pub mod grpc;
pub mod http;

/// Instrumentation scope name for spans and instruments created here.
pub(crate) const INSTRUMENTATION_SCOPE: &str = env!("CARGO_PKG_NAME");

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

type RoutePredicate = dyn Fn(&str) -> bool + Send + Sync;

/// Which requests the logging and tracing stages skip.
///
/// A request is skipped when its path (HTTP) or full method name (gRPC) is in
/// the exclusion set, or when the skip predicate returns `true` for it.
/// Recovery always applies.
#[derive(Clone, Default)]
pub struct MiddlewareConfig {
    excluded: HashSet<String>,
    skip_route: Option<Arc<RoutePredicate>>,
}

impl MiddlewareConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_excluded_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn with_skip_route(mut self, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.skip_route = Some(Arc::new(predicate));
        self
    }

    pub fn is_excluded(&self, route: &str) -> bool {
        self.excluded.contains(route) || self.skip_route.as_ref().is_some_and(|skip| skip(route))
    }
}

impl fmt::Debug for MiddlewareConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareConfig")
            .field("excluded", &self.excluded)
            .field("skip_route", &self.skip_route.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Trace id hand-off
// ---------------------------------------------------------------------------

/// Request extension through which the tracing stage publishes its span's
/// trace id to the stages wrapped around it.
#[derive(Clone, Debug, Default)]
pub(crate) struct TraceSlot(Arc<OnceLock<String>>);

impl TraceSlot {
    /// The slot already on `req`, or a fresh one inserted into it.
    pub(crate) fn ensure<B>(req: &mut ::http::Request<B>) -> Self {
        req.extensions_mut()
            .get_or_insert_with(TraceSlot::default)
            .clone()
    }

    /// Store the trace id of the span in `cx`, if it is valid.
    pub(crate) fn record(&self, cx: &Context) {
        if let Some(id) = trace_id_of(cx) {
            let _ = self.0.set(id);
        }
    }

    /// Recorded trace id, else the one on the current task, else `None`.
    pub(crate) fn resolve(&self) -> Option<String> {
        self.0
            .get()
            .cloned()
            .or_else(|| trace_id_of(&Context::current()))
    }
}

/// Render a panic payload for logs and error bodies.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
