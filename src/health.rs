//! HTTP health server.
//!
//! `/healthz` reports liveness. `/readyz` reports readiness, which requires
//! every pinned binding to be published: until then, requests carrying that
//! routing key would fail with 503.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::server::PinSet;

fn text(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

/// Handles health check requests.
pub async fn health_handler<B>(
    req: Request<B>,
    pins: Arc<PinSet>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/healthz" => text(StatusCode::OK, "ok".to_string()),
        "/readyz" => {
            if pins.is_ready() {
                text(StatusCode::OK, "ok".to_string())
            } else {
                text(
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("pending pins: {}", pins.pending().join(",")),
                )
            }
        }
        _ => text(StatusCode::NOT_FOUND, "not found".to_string()),
    };
    Ok(response)
}

/// Starts the HTTP health server on the given address.
///
/// Runs indefinitely, accepting connections and handling health requests.
pub async fn start_health_server(addr: SocketAddr, pins: Arc<PinSet>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "health server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let pins = Arc::clone(&pins);

        tokio::spawn(async move {
            let service = service_fn(move |req| health_handler(req, Arc::clone(&pins)));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "health connection error");
            }
        });
    }
}
