//! Remote Asset Endpoint
//!
//! Serves this node's cache to peers and accepts peer registrations.
//! Unauthenticated and unthrottled.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::http::request::Parts;
use hyper::{Method, StatusCode};
use tracing::{debug, instrument};

use super::{query_params, text, with_type, HttpHandler, HttpResponse};
use crate::asset::AssetId;
use crate::cache::AssetCacheEngine;
use crate::peer::wire;

/// Peer-facing asset endpoint
pub struct AssetEndpoint {
    engine: Arc<AssetCacheEngine>,
    asset_prefix: String,
    register_prefix: String,
    sync_timeout: Duration,
    legacy_wire: bool,
    dump: bool,
}

impl AssetEndpoint {
    pub fn new(
        engine: Arc<AssetCacheEngine>,
        asset_prefix: impl Into<String>,
        register_prefix: impl Into<String>,
    ) -> Self {
        let sync_timeout = engine.config().sync_timeout;
        Self {
            engine,
            asset_prefix: asset_prefix.into(),
            register_prefix: register_prefix.into(),
            sync_timeout,
            legacy_wire: false,
            dump: false,
        }
    }

    /// Serve the payload-only response form
    pub fn with_legacy_wire(mut self, legacy: bool) -> Self {
        self.legacy_wire = legacy;
        self
    }

    /// Log every query pair and header
    pub fn with_dump(mut self, dump: bool) -> Self {
        self.dump = dump;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    #[instrument(skip(self, parts, remote), fields(remote = %remote))]
    async fn fetch(&self, parts: &Parts, remote: SocketAddr) -> HttpResponse {
        let params = query_params(&parts.uri);
        if self.dump {
            for (key, value) in &params {
                debug!(key = %key, value = %value, "Request parameter");
            }
            for (name, value) in &parts.headers {
                debug!(header = %name, value = ?value, "Request header");
            }
        }

        self.engine.resolver().note_inbound(&remote.ip().to_string());

        let Some(raw) = params.get("asset") else {
            return text(StatusCode::BAD_REQUEST, "missing asset parameter");
        };
        let id: AssetId = match raw.parse() {
            Ok(id) => id,
            Err(e) => return text(StatusCode::BAD_REQUEST, e.to_string()),
        };
        if id.is_zero() {
            return text(StatusCode::BAD_REQUEST, "invalid asset id");
        }
        let is_texture = params
            .get("texture")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        // Non-retryable: a miss here never escalates to this node's peers
        match self
            .engine
            .get_sync_with(id, is_texture, false, self.sync_timeout)
            .await
        {
            Some(asset) => {
                debug!(%id, size = asset.len(), "Serving asset to peer");
                let body = if self.legacy_wire {
                    wire::encode_legacy(&asset)
                } else {
                    wire::encode_asset(&asset)
                };
                with_type(StatusCode::OK, body, "text/xml; charset=utf-8")
            }
            None => text(StatusCode::NOT_FOUND, "Asset not found"),
        }
    }

    fn register(&self, parts: &Parts) -> HttpResponse {
        let params = query_params(&parts.uri);
        let ip = params.get("ip").map(|ip| ip.trim()).filter(|ip| !ip.is_empty());
        let port = params.get("port").and_then(|p| p.trim().parse::<u16>().ok());

        let (Some(ip), Some(port)) = (ip, port) else {
            return text(StatusCode::BAD_REQUEST, "missing or invalid ip/port");
        };

        let resolver = self.engine.resolver();
        let prefix = resolver.config().asset_prefix.clone();
        let outcome = resolver.register_peer(ip, port, &prefix);
        text(StatusCode::OK, format!("{:?}", outcome))
    }
}

#[async_trait]
impl HttpHandler for AssetEndpoint {
    async fn handle(&self, parts: &Parts, remote: SocketAddr) -> HttpResponse {
        if parts.method != Method::GET {
            return text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }
        let path = parts.uri.path();
        if path == self.asset_prefix {
            self.fetch(parts, remote).await
        } else if path == self.register_prefix {
            self.register(parts)
        } else {
            text(StatusCode::NOT_FOUND, "not found")
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
