//! Structured JSON logger.
//!
//! A [`Logger`] owns its own `tracing` dispatcher, so it can be handed to the
//! request pipelines and used in tests without touching the process-wide
//! subscriber. [`Logger::install_global`] additionally makes it the default
//! for the plain `tracing` macros.
//!
//! Every line carries the service name and version from a root `service` span.
//! When built with an OpenTelemetry tracer, spans entered through the logger
//! are exported as well.

use std::{
    fmt,
    io::{self, Write},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::{
    dispatcher::{self, Dispatch, SetGlobalDefaultError},
    level_filters::LevelFilter,
    Span,
};
use tracing_subscriber::{fmt::MakeWriter, layer::SubscriberExt, EnvFilter, Registry};

use crate::Settings;

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Shared, flushable log destination.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl LogSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Line-buffered standard output.
    pub fn stdout() -> Self {
        Self::new(io::LineWriter::new(io::stdout()))
    }

    /// Flush anything buffered in the underlying writer.
    pub fn flush(&self) -> io::Result<()> {
        self.lock().flush()
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.lock().write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = LogSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSink").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures a [`Logger`].
pub struct LoggerBuilder {
    service_name: String,
    version: String,
    level: String,
    honour_env: bool,
    sink: Option<LogSink>,
    otel_tracer: Option<opentelemetry_sdk::trace::Tracer>,
}

impl LoggerBuilder {
    /// Override the minimum level. Unknown levels fall back to `info`.
    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Write lines to `writer` instead of standard output.
    pub fn writer(self, writer: impl Write + Send + 'static) -> Self {
        self.sink(LogSink::new(writer))
    }

    pub fn sink(mut self, sink: LogSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Export spans entered through the logger with `tracer`.
    pub fn otel_tracer(mut self, tracer: opentelemetry_sdk::trace::Tracer) -> Self {
        self.otel_tracer = Some(tracer);
        self
    }

    /// Use the configured level even when `RUST_LOG` is set.
    pub fn ignore_env_filter(mut self) -> Self {
        self.honour_env = false;
        self
    }

    pub fn build(self) -> Logger {
        let sink = self.sink.unwrap_or_else(LogSink::stdout);

        let filter = if self.honour_env {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter(&self.level))
        } else {
            level_filter(&self.level)
        };

        let otel_layer = self
            .otel_tracer
            .map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

        let subscriber = Registry::default()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(sink.clone()),
            )
            .with(otel_layer);

        let dispatch = Dispatch::new(subscriber);
        let service_span = dispatcher::with_default(&dispatch, || {
            tracing::info_span!(
                "service",
                service.name = %self.service_name,
                service.version = %self.version,
            )
        });

        Logger {
            dispatch,
            service_span,
            sink,
        }
    }
}

fn level_filter(level: &str) -> EnvFilter {
    let level = match level.trim().to_ascii_lowercase().parse::<LevelFilter>() {
        Ok(level) if level != LevelFilter::OFF => level,
        _ => LevelFilter::INFO,
    };
    EnvFilter::new(level.to_string())
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

/// Key/value pairs attached to a log line.
pub type Fields<'a> = &'a [(&'a str, &'a dyn fmt::Display)];

/// JSON logger bound to one service identity.
#[derive(Clone)]
pub struct Logger {
    dispatch: Dispatch,
    service_span: Span,
    sink: LogSink,
}

impl Logger {
    /// Logger for `settings` writing to standard output.
    pub fn new(settings: &Settings) -> Self {
        Self::builder(settings).build()
    }

    /// Builder seeded with the service identity and level from `settings`.
    pub fn builder(settings: &Settings) -> LoggerBuilder {
        LoggerBuilder {
            service_name: settings.service_name.clone(),
            version: settings.version.clone(),
            level: settings.log_level.clone(),
            honour_env: true,
            sink: None,
            otel_tracer: None,
        }
    }

    /// Run `f` with this logger as the current dispatcher, inside the
    /// service span. `tracing` macros called from `f` go to this logger.
    pub fn emit<R>(&self, f: impl FnOnce() -> R) -> R {
        dispatcher::with_default(&self.dispatch, || self.service_span.in_scope(f))
    }

    pub fn debug(&self, message: &str, fields: Fields<'_>) {
        self.emit(|| tracing::debug!(attrs = %AttrMap(fields), "{message}"));
    }

    pub fn info(&self, message: &str, fields: Fields<'_>) {
        self.emit(|| tracing::info!(attrs = %AttrMap(fields), "{message}"));
    }

    pub fn warn(&self, message: &str, fields: Fields<'_>) {
        self.emit(|| tracing::warn!(attrs = %AttrMap(fields), "{message}"));
    }

    pub fn error(&self, message: &str, fields: Fields<'_>) {
        self.emit(|| tracing::error!(attrs = %AttrMap(fields), "{message}"));
    }

    /// Log at error level with `fatal=true`, flush, and exit with status 1.
    pub fn fatal(&self, message: &str, fields: Fields<'_>) -> ! {
        self.emit(|| tracing::error!(fatal = true, attrs = %AttrMap(fields), "{message}"));
        let _ = self.sync();
        std::process::exit(1)
    }

    /// Flush buffered output.
    ///
    /// # Errors
    ///
    /// Returns the underlying writer's flush error.
    pub fn sync(&self) -> io::Result<()> {
        self.sink.flush()
    }

    /// Make this logger the process-wide default subscriber.
    ///
    /// # Errors
    ///
    /// Fails if a global subscriber has already been set.
    pub fn install_global(&self) -> Result<(), SetGlobalDefaultError> {
        dispatcher::set_global_default(self.dispatch.clone())
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

/// Renders the pairs as one JSON object, so keys and values survive
/// separators and spaces in either.
struct AttrMap<'a>(Fields<'a>);

impl fmt::Display for AttrMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map: serde_json::Map<String, serde_json::Value> = self
            .0
            .iter()
            .map(|(key, value)| ((*key).to_owned(), serde_json::Value::String(value.to_string())))
            .collect();
        write!(f, "{}", serde_json::Value::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use crate::{test_support::capture, Logger, Settings};

    /// Set in the re-executed test binary that is expected to exit.
    const FATAL_CHILD: &str = "OBSERVABILITY_FATAL_CHILD";

    fn attrs(line: &serde_json::Value) -> serde_json::Value {
        serde_json::from_str(line["attrs"].as_str().unwrap()).unwrap()
    }

    #[test]
    fn lines_are_json_with_service_identity() {
        let (logger, logs) = capture("info");
        logger.info("service started", &[("port", &8080), ("mode", &"pull")]);

        let lines = logs.lines();
        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert_eq!(line["level"], "INFO");
        assert_eq!(line["message"], "service started");
        assert_eq!(attrs(line)["port"], "8080");
        assert_eq!(attrs(line)["mode"], "pull");
        assert_eq!(line["span"]["service.name"], "test-service");
    }

    #[test]
    fn each_attribute_keeps_its_own_key() {
        let (logger, logs) = capture("info");
        let err = "dial tcp 10.0.0.1:4317: connection refused";
        logger.error("export failed", &[("error", &err), ("retry in", &"5s")]);

        let line = &logs.lines()[0];
        let attrs = attrs(line);
        assert_eq!(attrs.as_object().unwrap().len(), 2);
        assert_eq!(attrs["error"], err);
        assert_eq!(attrs["retry in"], "5s");
    }

    #[test]
    fn fatal_logs_flushes_and_exits_with_status_one() {
        if std::env::var_os(FATAL_CHILD).is_some() {
            let settings = Settings {
                service_name: "fatal-test".into(),
                ..Settings::default()
            };
            Logger::builder(&settings)
                .ignore_env_filter()
                .build()
                .fatal("cannot continue", &[("reason", &"disk full")]);
        }

        let output = Command::new(std::env::current_exe().unwrap())
            .args([
                "logger::tests::fatal_logs_flushes_and_exits_with_status_one",
                "--exact",
                "--nocapture",
                "--quiet",
            ])
            .env(FATAL_CHILD, "1")
            .output()
            .unwrap();
        assert_eq!(output.status.code(), Some(1));

        let stdout = String::from_utf8(output.stdout).unwrap();
        let line = stdout
            .lines()
            .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
            .find(|l| l["message"] == "cannot continue")
            .unwrap_or_else(|| panic!("no fatal line in {stdout:?}"));
        assert_eq!(line["level"], "ERROR");
        assert_eq!(line["fatal"], true);
        assert_eq!(attrs(&line)["reason"], "disk full");
        assert_eq!(line["span"]["service.name"], "fatal-test");
    }

    #[test]
    fn level_filters_lower_severities() {
        let (logger, logs) = capture("warn");
        logger.debug("d", &[]);
        logger.info("i", &[]);
        logger.warn("w", &[]);
        logger.error("e", &[]);

        let messages: Vec<_> = logs.lines().iter().map(|l| l["message"].clone()).collect();
        assert_eq!(messages, vec!["w", "e"]);
    }

    #[test]
    fn invalid_level_falls_back_to_info() {
        let (logger, logs) = capture("invalid");
        logger.debug("hidden", &[]);
        logger.info("shown", &[]);

        let lines = logs.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["message"], "shown");
    }

    #[test]
    fn emit_routes_plain_macros_to_this_logger() {
        let (logger, logs) = capture("debug");
        logger.emit(|| tracing::debug!(method = "GET", "request"));

        let lines = logs.lines();
        assert_eq!(lines[0]["method"], "GET");
        assert_eq!(lines[0]["level"], "DEBUG");
    }

    #[test]
    fn sync_succeeds_on_memory_writer() {
        let (logger, _logs) = capture("info");
        logger.sync().unwrap();
    }
}
