//! Health and Metrics Servers
//!
//! Small hyper servers for kubelet probes (`/healthz`, `/livez`, `/readyz`)
//! and Prometheus scraping (`/metrics`). Both stop when the shutdown token
//! is cancelled.

use crate::error::{Error, Result};
use crate::metrics::OperatorMetrics;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

type Readiness = Arc<dyn Fn() -> bool + Send + Sync>;

/// State shared by the probe and metrics handlers
#[derive(Clone)]
pub struct ServerState {
    metrics: Arc<OperatorMetrics>,
    readiness: Readiness,
}

impl ServerState {
    /// `ready` decides the `/readyz` answer on every probe
    pub fn new<F>(metrics: Arc<OperatorMetrics>, ready: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            metrics,
            readiness: Arc::new(ready),
        }
    }

    /// Answer every request for `path`
    pub fn respond(&self, path: &str) -> Response<Body> {
        match path {
            "/healthz" | "/livez" => text(StatusCode::OK, "ok"),
            "/readyz" if (self.readiness)() => text(StatusCode::OK, "ok"),
            "/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
            "/metrics" => match self.metrics.encode() {
                Ok((content_type, body)) => {
                    let mut response = Response::new(Body::from(body));
                    if let Ok(value) = HeaderValue::from_str(&content_type) {
                        response.headers_mut().insert(CONTENT_TYPE, value);
                    }
                    response
                }
                Err(e) => {
                    error!("Failed to encode metrics: {}", e);
                    text(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
                }
            },
            _ => text(StatusCode::NOT_FOUND, "not found"),
        }
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}

/// Serve `state` on `addr` until `token` is cancelled
pub async fn serve(
    name: &str,
    addr: &str,
    state: ServerState,
    token: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} server address: {}", name, e)))?;

    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let response = state.respond(req.uri().path());
                async move { Ok::<_, Infallible>(response) }
            }))
        }
    });

    info!("{} server listening on {}", name, addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("{} server bind failed: {}", name, e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("{} server error: {}", name, e)))?;

    info!("{} server stopped", name);
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
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
