//! HTTP endpoints for Prometheus scraping and liveness probes.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{Error, Result};

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    let mut response = text(StatusCode::OK, buffer);
    if let Ok(value) = encoder.format_type().parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// Route a request for either server.
fn route(path: &str, ready: &AtomicBool) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => metrics_response(),
        "/healthz" | "/livez" => text(StatusCode::OK, "ok"),
        "/readyz" if ready.load(Ordering::Acquire) => text(StatusCode::OK, "ok"),
        "/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, "first cycle pending"),
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Serve `/metrics`, `/healthz`, `/livez` and `/readyz` on `addr` until
/// `shutdown` fires. `ready` flips `/readyz` to 200.
pub async fn serve(
    name: &'static str,
    addr: String,
    ready: Arc<AtomicBool>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {} server address: {}", name, e)))?;
    let listener = TcpListener::bind(addr).await?;
    info!("{} server listening on {}", name, addr);

    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("{} server shutting down", name);
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!("{} server accept error: {}", name, e);
                    continue;
                }
            },
        };

        let ready = ready.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let response = route(req.uri().path(), &ready);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                error!("{} server connection error: {}", name, e);
            }
        });
    }
}
