//! OTEL SDK initialisation: span export, metrics readers and teardown.

use std::{fmt, io, net::SocketAddr, time::Duration};

use opentelemetry::{
    metrics::{Meter, MeterProvider as _, MetricsError},
    trace::{noop::NoopTracerProvider, TraceError, TracerProvider as _},
    KeyValue,
};
use opentelemetry_otlp::{MetricsExporterBuilder, SpanExporterBuilder, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{
        reader::{DefaultAggregationSelector, DefaultTemporalitySelector, MetricReader},
        PeriodicReader, SdkMeterProvider,
    },
    runtime,
    trace::{self as sdktrace, Sampler, TracerProvider},
    Resource,
};
use opentelemetry_prometheus::PrometheusExporter;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

use super::{global, scrape::ScrapeServer};
use crate::config::{PushProtocol, Settings};

/// Errors that abort [`init_telemetry`].
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry must be initialised from within a Tokio runtime")]
    NoRuntime,

    #[error("failed to create trace exporter: {0}")]
    TraceExporter(#[source] TraceError),

    #[error("failed to create OTLP {protocol} metrics exporter: {source}")]
    MetricsExporter {
        protocol: PushProtocol,
        #[source]
        source: MetricsError,
    },

    #[error("failed to create prometheus exporter: {0}")]
    PrometheusExporter(#[source] MetricsError),

    #[error("metrics path must start with '/': {0:?}")]
    InvalidMetricsPath(String),

    #[error("failed to bind metrics server addr {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Every step that failed during [`TelemetryHandle::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownError {
    failures: Vec<String>,
}

impl ShutdownError {
    pub fn failures(&self) -> &[String] {
        &self.failures
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "telemetry shutdown failures: {}", self.failures.join("; "))
    }
}

impl std::error::Error for ShutdownError {}

/// Owns the providers, readers and scrape server built by [`init_telemetry`].
pub struct TelemetryHandle {
    tracer_provider: TracerProvider,
    meter_provider: SdkMeterProvider,
    push_readers: Vec<PeriodicReader>,
    scrape_server: Option<ScrapeServer>,
}

/// Build the tracing and metrics pipelines from `settings` and install them
/// process-wide.
///
/// Configures:
/// - A batch OTLP/HTTP span exporter sampled by trace-id ratio.
/// - A periodic OTLP metrics reader when the mode includes push.
/// - A Prometheus reader plus scrape server when the mode includes pull, or
///   when no other reader was configured.
/// - The W3C trace-context + baggage propagator.
///
/// Globals are only replaced once everything has been built, so a failure
/// leaves the process-wide state untouched.
///
/// # Errors
///
/// Returns an error if called outside a Tokio runtime, if an exporter cannot
/// be created, or if the scrape port cannot be bound.
pub fn init_telemetry(settings: &Settings) -> Result<TelemetryHandle, TelemetryError> {
    if tokio::runtime::Handle::try_current().is_err() {
        return Err(TelemetryError::NoRuntime);
    }
    if !settings.metrics_path.starts_with('/') {
        return Err(TelemetryError::InvalidMetricsPath(
            settings.metrics_path.clone(),
        ));
    }

    let resource = service_resource(settings);

    // --- Exporters and readers ---
    // Everything fallible runs before the batch span processor is started.
    let span_exporter = SpanExporterBuilder::from(
        opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(traces_url(&settings.tracing_endpoint)),
    )
    .build_span_exporter()
    .map_err(TelemetryError::TraceExporter)?;

    let mut push_readers = Vec::new();
    if settings.metrics_mode.is_push() {
        push_readers.push(push_reader(settings)?);
    }

    let mut pull = None;
    if settings.metrics_mode.is_pull() || push_readers.is_empty() {
        let registry = prometheus::Registry::new();
        let exporter: PrometheusExporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(TelemetryError::PrometheusExporter)?;
        let server = ScrapeServer::bind(settings.metrics_port, &settings.metrics_path, registry)?;
        pull = Some((exporter, server));
    }

    // --- Tracing pipeline ---
    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(span_exporter, runtime::Tokio)
        .with_config(
            sdktrace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(settings.sample_rate))
                .with_resource(resource.clone()),
        )
        .build();

    // --- Metrics pipeline ---
    let mut meter_builder = SdkMeterProvider::builder().with_resource(resource);
    for reader in &push_readers {
        meter_builder = meter_builder.with_reader(reader.clone());
    }
    let mut scrape_server = None;
    if let Some((exporter, server)) = pull {
        meter_builder = meter_builder.with_reader(exporter);
        scrape_server = Some(server);
    }

    let meter_provider = meter_builder.build();

    // --- Globals ---
    global::install(&tracer_provider, &meter_provider);

    info!(
        service = %settings.service_name,
        metrics_mode = %settings.metrics_mode,
        push_readers = push_readers.len(),
        scrape_addr = ?scrape_server.as_ref().map(ScrapeServer::local_addr),
        "telemetry initialised"
    );

    Ok(TelemetryHandle {
        tracer_provider,
        meter_provider,
        push_readers,
        scrape_server,
    })
}

fn push_reader(settings: &Settings) -> Result<PeriodicReader, TelemetryError> {
    let endpoint = endpoint_url(&settings.push_endpoint);
    let builder = match settings.push_protocol {
        PushProtocol::Grpc => MetricsExporterBuilder::from(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        ),
        PushProtocol::Http => MetricsExporterBuilder::from(
            opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(format!("{endpoint}/v1/metrics")),
        ),
    };
    let exporter = builder
        .build_metrics_exporter(
            Box::new(DefaultTemporalitySelector::new()),
            Box::new(DefaultAggregationSelector::new()),
        )
        .map_err(|source| TelemetryError::MetricsExporter {
            protocol: settings.push_protocol,
            source,
        })?;

    Ok(PeriodicReader::builder(exporter, runtime::Tokio)
        .with_interval(settings.push_interval())
        .build())
}

fn service_resource(settings: &Settings) -> Resource {
    Resource::new(vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            settings.service_name.clone(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            settings.version.clone(),
        ),
    ])
}

/// Endpoints are configured as `host:port`; the exporters want a URL.
fn endpoint_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.contains("://") {
        endpoint.to_owned()
    } else {
        format!("http://{endpoint}")
    }
}

fn traces_url(endpoint: &str) -> String {
    format!("{}/v1/traces", endpoint_url(endpoint))
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

impl TelemetryHandle {
    /// Address of the scrape endpoint, when pull export is active.
    pub fn scrape_addr(&self) -> Option<SocketAddr> {
        self.scrape_server.as_ref().map(ScrapeServer::local_addr)
    }

    /// Number of push-mode readers (0 or 1).
    pub fn push_reader_count(&self) -> usize {
        self.push_readers.len()
    }

    /// Tracer bound to this handle's provider, independent of the globals.
    pub fn tracer(&self, name: &'static str) -> sdktrace::Tracer {
        self.tracer_provider.tracer(name)
    }

    /// Meter bound to this handle's provider, independent of the globals.
    pub fn meter(&self, name: &'static str) -> Meter {
        self.meter_provider.meter(name)
    }

    /// Flush and stop everything, bounded by `deadline`.
    ///
    /// Steps run in order and every step runs even if an earlier one failed:
    /// 1. force-flush the meter provider
    /// 2. force-flush the tracer provider
    /// 3. stop the scrape server
    /// 4. stop the tracer provider
    /// 5. stop the meter provider
    /// 6. stop each push reader
    ///
    /// Process-wide providers are reset to no-ops afterwards.
    ///
    /// # Errors
    ///
    /// Returns every step that failed or ran past the deadline.
    pub async fn shutdown(self, deadline: Duration) -> Result<(), ShutdownError> {
        let deadline = Instant::now() + deadline;
        let mut failures = Vec::new();

        let mp = self.meter_provider.clone();
        record(
            &mut failures,
            blocking_step(deadline, "meter provider force flush", move || mp.force_flush()).await,
        );

        let tp = self.tracer_provider.clone();
        record(
            &mut failures,
            blocking_step(deadline, "tracer provider force flush", move || {
                tp.force_flush().into_iter().collect::<Result<Vec<()>, _>>()
            })
            .await,
        );

        if let Some(server) = self.scrape_server {
            let outcome = match timeout_at(deadline, server.stop()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(format!("metrics server shutdown error: {e}")),
                Err(_) => Err("metrics server shutdown timed out".to_owned()),
            };
            record(&mut failures, outcome);
        }

        // SDK 0.23 has no provider shutdown call. Span processors shut down
        // when the last provider reference is dropped, and their errors go to
        // `global::handle_error`, so this step can only fail by timing out.
        let previous = opentelemetry::global::set_tracer_provider(NoopTracerProvider::new());
        let tp = self.tracer_provider;
        record(
            &mut failures,
            blocking_step(deadline, "tracer provider shutdown", move || {
                drop(previous);
                drop(tp);
                Ok::<(), std::convert::Infallible>(())
            })
            .await,
        );

        let mp = self.meter_provider;
        let meter_outcome =
            blocking_step(deadline, "meter provider shutdown", move || mp.shutdown()).await;
        let readers_already_stopped = meter_outcome.is_ok();
        record(&mut failures, meter_outcome);

        // The meter provider stops its own readers; these only matter when that failed.
        if !readers_already_stopped {
            for reader in self.push_readers {
                record(
                    &mut failures,
                    blocking_step(deadline, "push metrics shutdown", move || reader.shutdown())
                        .await,
                );
            }
        }

        global::reset();

        if failures.is_empty() {
            info!("telemetry shut down");
            Ok(())
        } else {
            let err = ShutdownError { failures };
            warn!(error = %err, "telemetry shut down with failures");
            Err(err)
        }
    }
}

impl fmt::Debug for TelemetryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryHandle")
            .field("scrape_addr", &self.scrape_addr())
            .field("push_readers", &self.push_readers.len())
            .finish_non_exhaustive()
    }
}

fn record(failures: &mut Vec<String>, outcome: Result<(), String>) {
    if let Err(e) = outcome {
        failures.push(e);
    }
}

/// Run a blocking SDK call off the async workers, bounded by `deadline`.
async fn blocking_step<T, E, F>(deadline: Instant, step: &str, f: F) -> Result<(), String>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    match timeout_at(deadline, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(Ok(_))) => Ok(()),
        Ok(Ok(Err(e))) => Err(format!("{step} error: {e}")),
        Ok(Err(e)) => Err(format!("{step} error: {e}")),
        Err(_) => Err(format!("{step} timed out")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_adds_scheme_once() {
        assert_eq!(endpoint_url("localhost:4318"), "http://localhost:4318");
        assert_eq!(endpoint_url("https://otel.example:443/"), "https://otel.example:443");
        assert_eq!(traces_url("collector:4318"), "http://collector:4318/v1/traces");
    }

    #[test]
    fn shutdown_error_joins_failures() {
        let err = ShutdownError {
            failures: vec![
                "meter provider force flush error: connection refused".into(),
                "tracer provider shutdown timed out".into(),
            ],
        };
        assert_eq!(
            err.to_string(),
            "telemetry shutdown failures: meter provider force flush error: connection refused; \
             tracer provider shutdown timed out"
        );
        assert_eq!(err.failures().len(), 2);
    }

    #[test]
    fn init_outside_runtime_fails_without_side_effects() {
        let settings = Settings {
            service_name: "no-runtime".into(),
            metrics_port: 1,
            ..Settings::default()
        };
        assert!(matches!(
            init_telemetry(&settings),
            Err(TelemetryError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn relative_metrics_path_is_rejected_before_any_work() {
        let settings = Settings {
            service_name: "bad-path".into(),
            metrics_path: "metrics".into(),
            ..Settings::default()
        };
        let err = init_telemetry(&settings).unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidMetricsPath(_)));
    }

    #[tokio::test]
    async fn blocking_step_reports_error_and_timeout() {
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = blocking_step(deadline, "flush", || Err::<(), _>("boom"))
            .await
            .unwrap_err();
        assert_eq!(err, "flush error: boom");

        let deadline = Instant::now() + Duration::from_millis(20);
        let err = blocking_step(deadline, "flush", || {
            std::thread::sleep(Duration::from_millis(500));
            Ok::<(), String>(())
        })
        .await
        .unwrap_err();
        assert_eq!(err, "flush timed out");
    }
}
