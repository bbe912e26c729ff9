//! Process-wide provider registry.
//!
//! [`install`] is called by the bootstrap once the providers are fully built;
//! [`reset`] is called after shutdown. Until the first install every accessor
//! hands out no-op implementations.

use std::borrow::Cow;

use opentelemetry::{
    global::{self, BoxedTracer},
    metrics::{noop::NoopMeterProvider, Meter},
    propagation::TextMapCompositePropagator,
    trace::{noop::NoopTracerProvider, TraceContextExt},
    Context,
};
use opentelemetry_sdk::{
    metrics::SdkMeterProvider,
    propagation::{BaggagePropagator, TraceContextPropagator},
    trace::TracerProvider,
};

/// Tracer from the current process-wide provider.
pub fn tracer(name: impl Into<Cow<'static, str>>) -> BoxedTracer {
    global::tracer(name)
}

/// Meter from the current process-wide provider.
pub fn meter(name: impl Into<Cow<'static, str>>) -> Meter {
    global::meter(name)
}

/// Trace id of the span active on the current task, as 32 lowercase hex
/// characters. `None` when no valid span is active.
pub fn current_trace_id() -> Option<String> {
    trace_id_of(&Context::current())
}

pub(crate) fn trace_id_of(cx: &Context) -> Option<String> {
    let span = cx.span();
    let span_context = span.span_context();
    span_context
        .is_valid()
        .then(|| format!("{:032x}", span_context.trace_id()))
}

/// Register both providers and the W3C trace-context + baggage propagator.
pub fn install(tracer_provider: &TracerProvider, meter_provider: &SdkMeterProvider) {
    let _ = global::set_tracer_provider(tracer_provider.clone());
    global::set_meter_provider(meter_provider.clone());
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));
}

/// Put no-op providers and an empty propagator back in place.
pub fn reset() {
    let _ = global::set_tracer_provider(NoopTracerProvider::new());
    global::set_meter_provider(NoopMeterProvider::new());
    global::set_text_map_propagator(TextMapCompositePropagator::new(Vec::new()));
}

#[cfg(test)]
mod tests {
    use opentelemetry::trace::{
        SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
    };

    use super::*;

    #[test]
    fn trace_id_is_none_without_a_span() {
        assert_eq!(trace_id_of(&Context::new()), None);
    }

    #[test]
    fn trace_id_is_32_lowercase_hex() {
        let sc = SpanContext::new(
            TraceId::from_hex("4BF92F3577B34DA6A3CE929D0E0E4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        let cx = Context::new().with_remote_span_context(sc);
        assert_eq!(
            trace_id_of(&cx).as_deref(),
            Some("4bf92f3577b34da6a3ce929d0e0e4736")
        );
    }

    #[test]
    fn accessors_work_before_install() {
        let _tracer = tracer("unit-test");
        let counter = meter("unit-test").u64_counter("noop_counter").init();
        counter.add(1, &[]);
        assert_eq!(current_trace_id(), None);
    }
}
