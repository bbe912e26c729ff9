//! `demo-service`: reference embedding of the observability crate.
//!
//! Startup sequence:
//! 1. Load and validate telemetry [`Settings`] and the server config.
//! 2. Initialise telemetry (traces, metrics, propagation).
//! 3. Build the logger and bridge `tracing` spans into OpenTelemetry.
//! 4. Start the HTTP and gRPC servers behind the request pipelines.
//! 5. On SIGINT/SIGTERM, drain both servers and shut telemetry down.

mod config;
mod server;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use observability::{build_info, init_telemetry, Logger, Settings};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use config::ServerConfig;
use server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let build = build_info!();
    let settings = Settings::load(&build).map_err(|e| {
        // Logging is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e}");
        e
    })?;
    let server_cfg = ServerConfig::from_env().map_err(|e| {
        eprintln!("ERROR: server configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    let telemetry = match init_telemetry(&settings) {
        Ok(handle) => handle,
        Err(e) => Logger::new(&settings).fatal(
            "failed to initialise telemetry",
            &[("error", &e)],
        ),
    };

    // -----------------------------------------------------------------------
    // 3. Logging
    // -----------------------------------------------------------------------
    let logger = Logger::builder(&settings)
        .otel_tracer(telemetry.tracer(env!("CARGO_PKG_NAME")))
        .build();
    logger
        .install_global()
        .context("failed to install global logger")?;

    info!(
        version = %settings.version,
        build_time = %settings.build_time,
        metrics_mode = %settings.metrics_mode,
        scrape_addr = ?telemetry.scrape_addr(),
        http_port = server_cfg.http_port,
        grpc_port = server_cfg.grpc_port,
        "demo-service starting"
    );

    // -----------------------------------------------------------------------
    // 4. Servers
    // -----------------------------------------------------------------------
    let shutdown = CancellationToken::new();

    let state = AppState::new(&settings.service_name, &settings.version);
    let router = server::router::build(state, logger.clone());
    let http_addr: SocketAddr = ([0, 0, 0, 0], server_cfg.http_port).into();
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {http_addr}"))?;
    info!(addr = %http_addr, "HTTP listening");

    let http_shutdown = shutdown.clone();
    let http = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(http_shutdown.cancelled_owned())
            .await
    });

    let grpc_addr: SocketAddr = ([0, 0, 0, 0], server_cfg.grpc_port).into();
    let grpc = tokio::spawn(server::grpc::serve(
        grpc_addr,
        settings.service_name.clone(),
        logger.clone(),
        shutdown.clone(),
    ));

    // -----------------------------------------------------------------------
    // 5. Shutdown
    // -----------------------------------------------------------------------
    wait_for_signal().await;
    info!("shutdown signal received");
    shutdown.cancel();

    match http.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "HTTP server exited with error"),
        Err(e) => warn!(error = %e, "HTTP server task failed"),
    }
    match grpc.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "gRPC server exited with error"),
        Err(e) => warn!(error = %e, "gRPC server task failed"),
    }

    if let Err(e) = telemetry.shutdown(server_cfg.shutdown_timeout()).await {
        logger.error("telemetry shutdown incomplete", &[("error", &e)]);
    }
    info!("demo-service stopped");
    let _ = logger.sync();

    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
