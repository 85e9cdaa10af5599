//! HTTP status endpoint.
//!
//! `GET /_status` returns a JSON health document, `GET /_metrics` the
//! Prometheus text exposition.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mtls_tunnel_core::metrics::TunnelMetrics;
use mtls_tunnel_core::{CertificateStore, TunnelMode};

const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// What the status endpoint reports on.
pub struct StatusState {
    pub mode: TunnelMode,
    pub store: Arc<CertificateStore>,
    pub metrics: Arc<TunnelMetrics>,
    pub active_connections: Arc<AtomicUsize>,
    pub draining: Arc<AtomicBool>,
}

#[derive(Debug, Serialize)]
struct StatusDocument {
    ok: bool,
    status: &'static str,
    certificate_version: u64,
    active_connections: usize,
    mode: TunnelMode,
}

impl StatusDocument {
    fn new(draining: bool, certificate_version: u64, active_connections: usize, mode: TunnelMode) -> Self {
        Self {
            ok: !draining,
            status: if draining { "draining" } else { "running" },
            certificate_version,
            active_connections,
            mode,
        }
    }
}

impl StatusState {
    fn document(&self) -> StatusDocument {
        StatusDocument::new(
            self.draining.load(Ordering::Relaxed),
            self.store.version(),
            self.active_connections.load(Ordering::Relaxed),
            self.mode,
        )
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn route(state: &StatusState, method: &Method, path: &str) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/_status") => {
            let document = state.document();
            let code = if document.ok {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            match serde_json::to_vec(&document) {
                Ok(body) => respond(code, "application/json", body),
                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
            }
        }
        (&Method::GET, "/_metrics") => match state.metrics.encode() {
            Ok(body) => respond(StatusCode::OK, "text/plain; version=0.0.4", body),
            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
        },
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    }
}

/// Serve the status endpoint until `shutdown` fires.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<StatusState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "status endpoint listening");

    let listener = &listener;
    accept_loop(
        move || async move { listener.accept().await.map(|(stream, _)| stream) },
        state,
        shutdown,
    )
    .await;
    Ok(())
}

/// Serve HTTP on every connection `accept` yields. Accept errors are logged
/// and the loop carries on after a short pause.
async fn accept_loop<F, Fut, S>(mut accept: F, state: Arc<StatusState>, shutdown: CancellationToken)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<S>>,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let stream = tokio::select! {
            accepted = accept() => match accepted {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "status endpoint accept error");
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                    continue;
                }
            },
            () = shutdown.cancelled() => break,
        };
        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let response = route(&state, req.method(), req.uri().path());
                async move { Ok::<_, hyper::Error>(response) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(error = %e, "status connection error");
            }
        });
    }

    debug!("status endpoint stopped");
}
