//! HTTP Surfaces
//!
//! ```text
//! ┌──────────────────────────────┐      ┌──────────────────────────────┐
//! │ AssetEndpoint (:9999)        │      │ AdminEndpoint (:9998)        │
//! │  {asset prefix}    fetch     │      │  /healthz /livez /readyz     │
//! │  {register prefix} register  │      │  /metrics /stats /peers      │
//! └──────────────────────────────┘      │  /expire /clear /purge       │
//!                                       └──────────────────────────────┘
//! ```
//!
//! Both are served by the same hyper http1 accept loop.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::http::request::Parts;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::Result;

pub mod admin;
pub mod endpoint;
pub mod health;

pub use admin::{AdminEndpoint, PrometheusExporter};
pub use endpoint::AssetEndpoint;
pub use health::{HealthCheck, HealthResponse, HealthStatus};

/// Response type shared by all handlers
pub type HttpResponse = Response<Full<Bytes>>;

/// A request handler that only needs the request head
#[async_trait]
pub trait HttpHandler: Send + Sync + 'static {
    async fn handle(&self, parts: &Parts, remote: SocketAddr) -> HttpResponse;
}

/// Accept connections until `shutdown` fires
pub async fn serve<H: HttpHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    shutdown: CancellationToken,
) -> Result<()> {
    let local = listener.local_addr()?;
    info!("HTTP server listening on {}", local);

    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };

        let io = TokioIo::new(stream);
        let handler = Arc::clone(&handler);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let handler = Arc::clone(&handler);
                async move {
                    let (parts, _body) = req.into_parts();
                    Ok::<_, Infallible>(handler.handle(&parts, remote).await)
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("HTTP connection error from {}: {}", remote, e);
            }
        });
    }

    info!("HTTP server on {} stopped", local);
    Ok(())
}

/// Plain-text response
pub fn text(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    with_type(status, body, "text/plain; charset=utf-8")
}

/// Response with an explicit content type
pub fn with_type(status: StatusCode, body: impl Into<Bytes>, content_type: &'static str) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// JSON response; serialization failures become a 500
pub fn json<T: serde::Serialize>(value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => with_type(StatusCode::OK, body, "application/json"),
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Decoded query parameters; later duplicates win
pub fn query_params(uri: &Uri) -> HashMap<String, String> {
    uri.query()
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode(key), decode(value))
        })
        .collect()
}

fn decode(raw: &str) -> String {
    let raw = raw.replace('+', " ");
    match urlencoding::decode(&raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_params() {
        let uri: Uri = "/rrs/register?ip=10.0.0.1&port=9999&name=a%20b+c&flag"
            .parse()
            .unwrap();
        let params = query_params(&uri);
        assert_eq!(params["ip"], "10.0.0.1");
        assert_eq!(params["port"], "9999");
        assert_eq!(params["name"], "a b c");
        assert_eq!(params["flag"], "");
    }

    #[test]
    fn test_query_params_empty() {
        let uri: Uri = "/stats".parse().unwrap();
        assert!(query_params(&uri).is_empty());
    }

    #[test]
    fn test_text_response() {
        let response = text(StatusCode::NOT_FOUND, "Asset not found");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }
}
