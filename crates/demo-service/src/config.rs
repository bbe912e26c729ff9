//! Listener and lifecycle settings for the demo service.
//!
//! Telemetry settings are loaded separately by [`observability::Settings`];
//! this only covers what the service itself needs. Values come from
//! `DEMO_`-prefixed environment variables.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Port the axum HTTP server listens on.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Port the tonic gRPC server listens on.
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,

    /// Upper bound for flushing and stopping telemetry on exit.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_http_port() -> u16 {
    8080
}
fn default_grpc_port() -> u16 {
    50051
}
fn default_shutdown_timeout() -> u64 {
    10
}

impl ServerConfig {
    /// Load and validate from `DEMO_HTTP_PORT`, `DEMO_GRPC_PORT` and
    /// `DEMO_SHUTDOWN_TIMEOUT_SECS`.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or a value is invalid.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::with_prefix("DEMO"))
            .build()
            .context("failed to build server configuration from environment")?;

        let c: ServerConfig = cfg
            .try_deserialize()
            .context("failed to deserialise server configuration")?;

        c.validate()?;
        Ok(c)
    }

    fn validate(&self) -> Result<()> {
        if self.http_port == self.grpc_port {
            anyhow::bail!("DEMO_HTTP_PORT and DEMO_GRPC_PORT must differ");
        }
        if self.shutdown_timeout_secs == 0 {
            anyhow::bail!("DEMO_SHUTDOWN_TIMEOUT_SECS must be > 0");
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ServerConfig {
        ServerConfig {
            http_port: default_http_port(),
            grpc_port: default_grpc_port(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert!(valid().validate().is_ok());
        assert_eq!(valid().shutdown_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn same_port_is_rejected() {
        let cfg = ServerConfig {
            grpc_port: 8080,
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let cfg = ServerConfig {
            shutdown_timeout_secs: 0,
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }
}
