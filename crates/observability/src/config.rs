//! Settings loading and validation.
//!
//! Values are read from environment variables, optionally seeded from a `.env`
//! file (INI syntax) in the working directory. Environment variables win over
//! `.env` values. Build metadata is merged in before validation.

use std::{fmt, str::FromStr, time::Duration};

use serde::Deserialize;
use thiserror::Error;

use crate::metadata::BuildInfo;

/// Errors produced while loading or validating [`Settings`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration sources could not be read or deserialised.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// A field failed validation.
    #[error("{0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Metrics mode
// ---------------------------------------------------------------------------

/// How metrics leave the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum MetricsMode {
    /// Exposed on a scrape endpoint.
    Pull,
    /// Exported periodically over OTLP.
    Push,
    /// Both of the above.
    Hybrid,
}

impl MetricsMode {
    /// `true` for [`MetricsMode::Pull`] and [`MetricsMode::Hybrid`].
    pub fn is_pull(self) -> bool {
        matches!(self, MetricsMode::Pull | MetricsMode::Hybrid)
    }

    /// `true` for [`MetricsMode::Push`] and [`MetricsMode::Hybrid`].
    pub fn is_push(self) -> bool {
        matches!(self, MetricsMode::Push | MetricsMode::Hybrid)
    }

    /// `true` only for [`MetricsMode::Hybrid`].
    pub fn is_hybrid(self) -> bool {
        self == MetricsMode::Hybrid
    }
}

impl FromStr for MetricsMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pull" => Ok(MetricsMode::Pull),
            "push" => Ok(MetricsMode::Push),
            "hybrid" => Ok(MetricsMode::Hybrid),
            other => Err(ConfigError::Invalid(format!(
                "invalid METRICS_MODE: {other} (must be 'pull', 'push', or 'hybrid')"
            ))),
        }
    }
}

impl TryFrom<String> for MetricsMode {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for MetricsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MetricsMode::Pull => "pull",
            MetricsMode::Push => "push",
            MetricsMode::Hybrid => "hybrid",
        })
    }
}

// ---------------------------------------------------------------------------
// Push protocol
// ---------------------------------------------------------------------------

/// Transport used by the push-mode OTLP metrics exporter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum PushProtocol {
    /// OTLP over HTTP/protobuf.
    #[default]
    Http,
    /// OTLP over gRPC.
    Grpc,
}

impl PushProtocol {
    /// Resolve a protocol name. Anything other than `grpc` (case-insensitive,
    /// surrounding whitespace ignored) resolves to [`PushProtocol::Http`].
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("grpc") {
            PushProtocol::Grpc
        } else {
            PushProtocol::Http
        }
    }
}

impl From<String> for PushProtocol {
    fn from(value: String) -> Self {
        PushProtocol::parse(&value)
    }
}

impl fmt::Display for PushProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PushProtocol::Http => "HTTP",
            PushProtocol::Grpc => "gRPC",
        })
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Validated observability settings.
///
/// Field names follow the environment variables they are read from
/// (`SERVICE_NAME`, `OTEL_ENDPOINT`, `METRICS_MODE`, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Logical service name. Falls back to the build metadata when unset.
    #[serde(default)]
    pub service_name: String,

    /// Service version, taken from build metadata.
    #[serde(skip)]
    pub version: String,

    /// Build timestamp, taken from build metadata.
    #[serde(skip)]
    pub build_time: String,

    /// One of `debug`, `info`, `warn`, `error`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// OTLP/HTTP collector endpoint for spans (`host:port` or a URL).
    #[serde(rename = "otel_endpoint", default = "default_tracing_endpoint")]
    pub tracing_endpoint: String,

    /// Fraction of traces sampled, within `[0, 1]`.
    #[serde(rename = "otel_tracing_sample_rate", default = "default_sample_rate")]
    pub sample_rate: f64,

    /// Pull, push or hybrid metrics export.
    #[serde(default = "default_metrics_mode")]
    pub metrics_mode: MetricsMode,

    /// Path the scrape endpoint is served on.
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    /// Port the scrape endpoint binds on all interfaces.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// OTLP collector endpoint for push-mode metrics. Required for push/hybrid.
    #[serde(rename = "metrics_push_endpoint", default)]
    pub push_endpoint: String,

    /// Seconds between push-mode exports.
    #[serde(rename = "metrics_push_interval", default = "default_push_interval")]
    pub push_interval_secs: u64,

    /// OTLP transport for push-mode metrics.
    #[serde(rename = "metrics_protocol", default = "default_push_protocol")]
    pub push_protocol: PushProtocol,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_tracing_endpoint() -> String {
    "localhost:4318".into()
}
fn default_sample_rate() -> f64 {
    1.0
}
fn default_metrics_mode() -> MetricsMode {
    MetricsMode::Pull
}
fn default_metrics_path() -> String {
    "/metrics".into()
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_push_interval() -> u64 {
    30
}
fn default_push_protocol() -> PushProtocol {
    PushProtocol::parse("otlp")
}

impl Default for Settings {
    /// Defaults for every field; `service_name` is left empty.
    fn default() -> Self {
        let build = BuildInfo::default();
        Self {
            service_name: String::new(),
            version: build.version,
            build_time: build.build_time,
            log_level: default_log_level(),
            tracing_endpoint: default_tracing_endpoint(),
            sample_rate: default_sample_rate(),
            metrics_mode: default_metrics_mode(),
            metrics_path: default_metrics_path(),
            metrics_port: default_metrics_port(),
            push_endpoint: String::new(),
            push_interval_secs: default_push_interval(),
            push_protocol: default_push_protocol(),
        }
    }
}

impl Settings {
    /// Load and validate settings from `.env` and the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or any field is invalid.
    pub fn load(build: &BuildInfo) -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::new(".env", config::FileFormat::Ini).required(false))
            .add_source(config::Environment::default());
        Self::from_builder(builder, build)
    }

    /// Build settings from an arbitrary configuration builder.
    pub(crate) fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
        build: &BuildInfo,
    ) -> Result<Self, ConfigError> {
        let mut settings: Settings = builder.build()?.try_deserialize()?;
        settings.apply_build_info(build);
        settings.validate()?;
        Ok(settings)
    }

    /// Merge build metadata. The service name is only filled in when the
    /// configuration left it empty; version and build time always come from
    /// the build.
    pub fn apply_build_info(&mut self, build: &BuildInfo) {
        if self.service_name.trim().is_empty() && !build.service_name.is_empty() {
            self.service_name = build.service_name.clone();
        }
        self.version = build.version.clone();
        self.build_time = build.build_time.clone();
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return invalid("SERVICE_NAME is required");
        }

        match self.log_level.trim().to_ascii_lowercase().as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => return invalid(format!("invalid LOG_LEVEL: {other}")),
        }

        if !(0.0..=1.0).contains(&self.sample_rate) {
            return invalid(format!(
                "OTEL_TRACING_SAMPLE_RATE must be within [0, 1], got {}",
                self.sample_rate
            ));
        }
        if self.metrics_port == 0 {
            return invalid("METRICS_PORT must be within [1, 65535]");
        }
        if !self.metrics_path.starts_with('/') {
            return invalid(format!(
                "METRICS_PATH must start with '/': {:?}",
                self.metrics_path
            ));
        }
        if self.metrics_mode.is_push() && self.push_endpoint.trim().is_empty() {
            return invalid("METRICS_PUSH_ENDPOINT is required for push/hybrid metrics mode");
        }
        if self.push_interval_secs == 0 {
            return invalid("METRICS_PUSH_INTERVAL must be > 0");
        }
        Ok(())
    }

    /// Interval between push-mode exports.
    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.push_interval_secs)
    }
}

fn invalid(msg: impl Into<String>) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(msg.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build() -> BuildInfo {
        BuildInfo::new("built-in-name", "v1.2.3", "2024-01-01T00:00:00Z")
    }

    fn valid() -> Settings {
        Settings {
            service_name: "orders".into(),
            ..Settings::default()
        }
    }

    #[test]
    fn defaults_are_correct() {
        assert_eq!(default_log_level(), "info");
        assert_eq!(default_tracing_endpoint(), "localhost:4318");
        assert_eq!(default_sample_rate(), 1.0);
        assert_eq!(default_metrics_mode(), MetricsMode::Pull);
        assert_eq!(default_metrics_path(), "/metrics");
        assert_eq!(default_metrics_port(), 9090);
        assert_eq!(default_push_interval(), 30);
        assert_eq!(default_push_protocol(), PushProtocol::Http);
    }

    #[test]
    fn metrics_mode_parsing_is_lenient_about_case_and_space() {
        assert_eq!(" PULL ".parse::<MetricsMode>().unwrap(), MetricsMode::Pull);
        assert_eq!("Push".parse::<MetricsMode>().unwrap(), MetricsMode::Push);
        assert_eq!("hybrid".parse::<MetricsMode>().unwrap(), MetricsMode::Hybrid);

        let err = "both".parse::<MetricsMode>().unwrap_err();
        assert!(err.to_string().contains("invalid METRICS_MODE: both"));
    }

    #[test]
    fn metrics_mode_predicates() {
        assert!(MetricsMode::Pull.is_pull() && !MetricsMode::Pull.is_push());
        assert!(MetricsMode::Push.is_push() && !MetricsMode::Push.is_pull());
        assert!(MetricsMode::Hybrid.is_pull() && MetricsMode::Hybrid.is_push());
        assert!(MetricsMode::Hybrid.is_hybrid() && !MetricsMode::Pull.is_hybrid());
    }

    #[test]
    fn unknown_push_protocol_falls_back_to_http() {
        assert_eq!(PushProtocol::parse("grpc"), PushProtocol::Grpc);
        assert_eq!(PushProtocol::parse(" GRPC "), PushProtocol::Grpc);
        assert_eq!(PushProtocol::parse("http"), PushProtocol::Http);
        assert_eq!(PushProtocol::parse("otlp"), PushProtocol::Http);
        assert_eq!(PushProtocol::parse(""), PushProtocol::Http);
        assert_eq!(PushProtocol::default(), PushProtocol::Http);
    }

    #[test]
    fn loads_from_sources_with_defaults() {
        let builder = config::Config::builder()
            .set_override("service_name", "test-service")
            .unwrap()
            .set_override("log_level", "debug")
            .unwrap()
            .set_override("metrics_port", "9091")
            .unwrap();

        let s = Settings::from_builder(builder, &build()).unwrap();
        assert_eq!(s.service_name, "test-service");
        assert_eq!(s.log_level, "debug");
        assert_eq!(s.metrics_port, 9091);
        assert_eq!(s.metrics_mode, MetricsMode::Pull);
        assert_eq!(s.metrics_path, "/metrics");
        assert_eq!(s.push_protocol, PushProtocol::Http);
        assert_eq!(s.version, "v1.2.3");
        assert_eq!(s.build_time, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn service_name_falls_back_to_build_metadata() {
        let s = Settings::from_builder(config::Config::builder(), &build()).unwrap();
        assert_eq!(s.service_name, "built-in-name");
    }

    #[test]
    fn configured_service_name_wins_over_build_metadata() {
        let mut s = valid();
        s.apply_build_info(&build());
        assert_eq!(s.service_name, "orders");
        assert_eq!(s.version, "v1.2.3");
    }

    #[test]
    fn push_mode_and_protocol_load_from_strings() {
        let builder = config::Config::builder()
            .set_override("service_name", "svc")
            .unwrap()
            .set_override("metrics_mode", "Hybrid")
            .unwrap()
            .set_override("metrics_push_endpoint", "collector:4317")
            .unwrap()
            .set_override("metrics_protocol", "grpc")
            .unwrap()
            .set_override("metrics_push_interval", "15")
            .unwrap();

        let s = Settings::from_builder(builder, &build()).unwrap();
        assert_eq!(s.metrics_mode, MetricsMode::Hybrid);
        assert_eq!(s.push_endpoint, "collector:4317");
        assert_eq!(s.push_protocol, PushProtocol::Grpc);
        assert_eq!(s.push_interval(), Duration::from_secs(15));
    }

    #[test]
    fn load_rejects_unknown_metrics_mode() {
        let builder = config::Config::builder()
            .set_override("service_name", "svc")
            .unwrap()
            .set_override("metrics_mode", "sideways")
            .unwrap();
        assert!(Settings::from_builder(builder, &BuildInfo::default()).is_err());
    }

    #[test]
    fn validate_rejects_empty_service_name() {
        let s = Settings::default();
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("SERVICE_NAME is required"));
    }

    #[test]
    fn validate_rejects_unknown_log_level() {
        let s = Settings {
            log_level: "verbose".into(),
            ..valid()
        };
        assert!(s.validate().unwrap_err().to_string().contains("invalid LOG_LEVEL"));
    }

    #[test]
    fn validate_rejects_out_of_range_sample_rate() {
        for rate in [-0.1, 1.5, f64::NAN] {
            let s = Settings {
                sample_rate: rate,
                ..valid()
            };
            assert!(s.validate().is_err(), "rate {rate} should be rejected");
        }
    }

    #[test]
    fn validate_rejects_zero_port_and_relative_path() {
        let s = Settings {
            metrics_port: 0,
            ..valid()
        };
        assert!(s.validate().is_err());

        let s = Settings {
            metrics_path: "metrics".into(),
            ..valid()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_requires_push_endpoint_for_push_modes() {
        for mode in [MetricsMode::Push, MetricsMode::Hybrid] {
            let s = Settings {
                metrics_mode: mode,
                ..valid()
            };
            let err = s.validate().unwrap_err();
            assert!(err.to_string().contains("METRICS_PUSH_ENDPOINT is required"));
        }
    }

    #[test]
    fn validate_rejects_zero_push_interval() {
        let s = Settings {
            push_interval_secs: 0,
            ..valid()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_accepts_valid_settings() {
        assert!(valid().validate().is_ok());

        let s = Settings {
            metrics_mode: MetricsMode::Push,
            push_endpoint: "localhost:4318".into(),
            sample_rate: 0.0,
            ..valid()
        };
        assert!(s.validate().is_ok());
    }
}
