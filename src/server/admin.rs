//! Admin Endpoint
//!
//! Operator surface of a node: health probes, Prometheus metrics, stats and
//! cache maintenance.
//!
//! | Path       | Effect                                   |
//! |------------|------------------------------------------|
//! | `/healthz` | 200 while live                           |
//! | `/readyz`  | 200 once ready and workers are running   |
//! | `/health`  | JSON health report                       |
//! | `/metrics` | Prometheus text exposition               |
//! | `/stats`   | JSON `CacheStats`                        |
//! | `/peers`   | JSON peer list                           |
//! | `/expire`  | drop `?asset=` from the memory tier      |
//! | `/clear`   | drop the memory tier and reset counters  |
//! | `/purge`   | drop expired entries                     |

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hyper::http::request::Parts;
use hyper::StatusCode;
use prometheus::{Encoder, Gauge, IntGauge, Registry, TextEncoder};
use serde::Serialize;
use tracing::{error, info};

use super::health::HealthCheck;
use super::{json, query_params, text, with_type, HttpHandler, HttpResponse};
use crate::asset::AssetId;
use crate::cache::{AssetCacheEngine, CacheStats};
use crate::error::{Error, Result};

type Extract = fn(&CacheStats) -> i64;

/// Gauges refreshed from `CacheStats` at scrape time
pub struct PrometheusExporter {
    registry: Registry,
    gauges: Vec<(IntGauge, Extract)>,
    hit_ratio: Gauge,
    miss_latency: Gauge,
}

impl PrometheusExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let mut gauges = Vec::new();

        let mut add = |name: &str, help: &str, extract: Extract| -> Result<()> {
            let gauge = IntGauge::new(name, help).map_err(prom_error)?;
            registry.register(Box::new(gauge.clone())).map_err(prom_error)?;
            gauges.push((gauge, extract));
            Ok(())
        };

        add("gridcache_cached_assets", "Assets in the memory tier", |s| s.cached_assets as i64)?;
        add("gridcache_cached_bytes", "Payload bytes in the memory tier", |s| s.cached_bytes as i64)?;
        add("gridcache_pending_groups", "Asset ids with an outstanding fetch", |s| s.pending_groups as i64)?;
        add("gridcache_pending_requesters", "Requesters waiting on a fetch", |s| s.pending_requesters as i64)?;
        add("gridcache_delivery_queue_depth", "Items in the delivery queue", |s| s.delivery_queue as i64)?;
        add("gridcache_region_queue_depth", "Groups in the deferred-region queue", |s| s.region_queue as i64)?;
        add("gridcache_client_queue_depth", "Groups in the deferred-client queue", |s| s.client_queue as i64)?;
        add("gridcache_peers", "Registered peer servers", |s| s.peers as i64)?;
        add("gridcache_hits", "Memory tier hits", |s| s.metrics.hits as i64)?;
        add("gridcache_misses", "Memory tier misses", |s| s.metrics.misses as i64)?;
        add("gridcache_folded_joins", "Requests folded into an existing fetch", |s| s.metrics.folded_joins as i64)?;
        add("gridcache_invalid_requests", "Rejected requests", |s| s.metrics.invalid_requests as i64)?;
        add("gridcache_store_requests", "Durable store requests", |s| s.metrics.upstream_requests as i64)?;
        add("gridcache_store_resolved", "Durable store hits", |s| s.metrics.store_resolved as i64)?;
        add("gridcache_store_unresolved", "Durable store misses", |s| s.metrics.store_unresolved as i64)?;
        add("gridcache_peer_lookups", "Peer fallback passes", |s| s.metrics.peer_lookups as i64)?;
        add("gridcache_peer_hits", "Assets found on a peer", |s| s.metrics.peer_hits as i64)?;
        add("gridcache_peer_misses", "Peer passes that found nothing", |s| s.metrics.peer_misses as i64)?;
        add("gridcache_peer_errors", "Failed peer requests", |s| s.metrics.peer_errors as i64)?;
        add("gridcache_deliveries", "Transfers handed to the transport", |s| s.metrics.deliveries as i64)?;
        add("gridcache_delivery_failures", "Transport failures", |s| s.metrics.delivery_failures as i64)?;
        add("gridcache_puts", "Assets stored by callers", |s| s.metrics.puts as i64)?;
        add("gridcache_duplicate_puts", "Puts for an already cached id", |s| s.metrics.duplicate_puts as i64)?;

        let hit_ratio = Gauge::new("gridcache_hit_ratio", "Memory tier hit ratio").map_err(prom_error)?;
        registry.register(Box::new(hit_ratio.clone())).map_err(prom_error)?;
        let miss_latency = Gauge::new(
            "gridcache_miss_latency_seconds",
            "Average time from miss to resolution",
        )
        .map_err(prom_error)?;
        registry.register(Box::new(miss_latency.clone())).map_err(prom_error)?;

        Ok(Self {
            registry,
            gauges,
            hit_ratio,
            miss_latency,
        })
    }

    /// Refresh every gauge and encode the registry
    pub fn render(&self, stats: &CacheStats) -> Result<String> {
        for (gauge, extract) in &self.gauges {
            gauge.set(extract(stats));
        }
        self.hit_ratio.set(stats.metrics.hit_ratio);
        self.miss_latency.set(stats.metrics.miss_latency_ms / 1000.0);

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(prom_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

fn prom_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("prometheus: {}", e))
}

#[derive(Serialize)]
struct PeerView {
    address: String,
    port: u16,
    path_prefix: String,
    failures: u32,
    registered_at: Option<DateTime<Utc>>,
}

/// Operator-facing endpoint
pub struct AdminEndpoint {
    engine: Arc<AssetCacheEngine>,
    health: Arc<HealthCheck>,
    exporter: PrometheusExporter,
}

impl AdminEndpoint {
    pub fn new(engine: Arc<AssetCacheEngine>, health: Arc<HealthCheck>) -> Result<Self> {
        Ok(Self {
            engine,
            health,
            exporter: PrometheusExporter::new()?,
        })
    }

    fn metrics(&self) -> HttpResponse {
        match self.exporter.render(&self.engine.stats()) {
            Ok(body) => {
                let mut response = text(StatusCode::OK, body);
                if let Ok(value) = self.exporter.content_type().parse() {
                    response
                        .headers_mut()
                        .insert(hyper::header::CONTENT_TYPE, value);
                }
                response
            }
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }

    fn peers(&self) -> HttpResponse {
        let registry = self.engine.resolver().registry();
        let peers: Vec<PeerView> = registry
            .snapshot()
            .into_iter()
            .map(|peer| PeerView {
                failures: registry.failures(&peer).unwrap_or(0),
                registered_at: registry.registered_at(&peer),
                address: peer.address,
                port: peer.port,
                path_prefix: peer.path_prefix,
            })
            .collect();
        json(&peers)
    }

    fn expire(&self, parts: &Parts) -> HttpResponse {
        let params = query_params(&parts.uri);
        let Some(id) = params.get("asset").and_then(|raw| raw.parse::<AssetId>().ok()) else {
            return text(StatusCode::BAD_REQUEST, "missing or invalid asset parameter");
        };
        if self.engine.expire(&id) {
            info!(%id, "Expired asset");
            text(StatusCode::OK, "expired")
        } else {
            text(StatusCode::NOT_FOUND, "not cached")
        }
    }
}

#[async_trait]
impl HttpHandler for AdminEndpoint {
    async fn handle(&self, parts: &Parts, _remote: SocketAddr) -> HttpResponse {
        match parts.uri.path() {
            "/healthz" | "/livez" => {
                if self.health.is_live() {
                    text(StatusCode::OK, "ok")
                } else {
                    text(StatusCode::SERVICE_UNAVAILABLE, "not live")
                }
            }
            "/readyz" => {
                if self.health.is_ready() && self.engine.is_running() {
                    text(StatusCode::OK, "ok")
                } else {
                    text(StatusCode::SERVICE_UNAVAILABLE, "not ready")
                }
            }
            "/health" => {
                let report = self
                    .health
                    .report(self.engine.is_running(), &self.engine.stats());
                json(&report)
            }
            "/metrics" => self.metrics(),
            "/stats" => json(&self.engine.stats()),
            "/peers" => self.peers(),
            "/expire" => self.expire(parts),
            "/clear" => {
                self.engine.clear();
                text(StatusCode::OK, "cleared")
            }
            "/purge" => {
                let purged = self.engine.purge_expired();
                with_type(
                    StatusCode::OK,
                    format!("{{\"purged\":{}}}", purged),
                    "application/json",
                )
            }
            _ => text(StatusCode::NOT_FOUND, "not found"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
