//! Prometheus scrape endpoint on its own listener.

use std::net::SocketAddr;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{info, warn};

use super::init::TelemetryError;

/// Background HTTP server exposing one registry on one path.
///
/// Dropping the server signals it to stop; [`ScrapeServer::stop`] also waits
/// for in-flight scrapes to finish.
pub(crate) struct ScrapeServer {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<std::io::Result<()>>>,
}

impl ScrapeServer {
    /// Bind `0.0.0.0:port` and start serving `path` in the background.
    ///
    /// The bind happens before this returns, so an unavailable port is
    /// reported to the caller rather than from the background task.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Bind`] if the listener cannot be created.
    pub(crate) fn bind(port: u16, path: &str, registry: Registry) -> Result<Self, TelemetryError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let bind_err = |source| TelemetryError::Bind { addr, source };

        let listener = std::net::TcpListener::bind(addr).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        let listener = tokio::net::TcpListener::from_std(listener).map_err(bind_err)?;

        let router = Router::new()
            .route(path, get(scrape))
            .with_state(registry);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        info!(addr = %local_addr, path, "metrics scrape endpoint listening");

        Ok(Self {
            addr: local_addr,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// The bound address; carries the real port when bound to port 0.
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and wait for the server task to exit.
    pub(crate) async fn stop(mut self) -> Result<(), String> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(e.to_string()),
        }
    }
}

impl Drop for ScrapeServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn scrape(State(registry): State<Registry>) -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        warn!(error = %e, "failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(header::CONTENT_TYPE, encoder.format_type().to_owned())],
        buffer,
    )
        .into_response()
}
