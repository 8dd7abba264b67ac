//! GridCache Integration Tests
//!
//! Drives the public API end to end:
//! - Request folding against a slow durable store
//! - Client transfers and delivery outcomes
//! - Peer fallback between two nodes over loopback HTTP

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gridcache::asset::{Asset, AssetId, AssetType};
use gridcache::cache::{
    AssetCacheEngine, AssetStore, AssetTransport, ClientHandle, DeliveryOutcome, EngineConfig,
    InMemoryAssetStore, InMemoryTransport, TransferRequest,
};
use gridcache::peer::{HttpPeerClient, PeerAssetResolver, PeerClient, ResolverConfig};
use gridcache::server::{self, AssetEndpoint};

// =============================================================================
// Helpers
// =============================================================================

struct Node {
    engine: Arc<AssetCacheEngine>,
    backend: Arc<InMemoryAssetStore>,
    transport: Arc<InMemoryTransport>,
}

fn node_with(config: EngineConfig, backend: InMemoryAssetStore) -> Node {
    let backend = Arc::new(backend);
    let transport = Arc::new(InMemoryTransport::new());
    let client = HttpPeerClient::new(Duration::from_secs(2)).unwrap();
    let resolver = Arc::new(PeerAssetResolver::new(
        Arc::new(client) as Arc<dyn PeerClient>,
        ResolverConfig {
            peer_timeout: Duration::from_secs(2),
            ..ResolverConfig::default()
        },
    ));
    let engine = AssetCacheEngine::new(
        config,
        Arc::clone(&backend) as Arc<dyn AssetStore>,
        resolver,
        Arc::clone(&transport) as Arc<dyn AssetTransport>,
    );
    engine.start();
    Node {
        engine,
        backend,
        transport,
    }
}

fn node() -> Node {
    node_with(EngineConfig::default(), InMemoryAssetStore::new())
}

fn direct_transfer(id: AssetId) -> TransferRequest {
    let params = Bytes::copy_from_slice(id.as_uuid().as_bytes());
    TransferRequest::from_params(ClientHandle::random(), Uuid::new_v4(), 2, params).unwrap()
}

fn inventory_transfer(id: AssetId) -> TransferRequest {
    let mut params = vec![0u8; 96];
    params[80..96].copy_from_slice(id.as_uuid().as_bytes());
    TransferRequest::from_params(ClientHandle::random(), Uuid::new_v4(), 3, Bytes::from(params))
        .unwrap()
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Serve a node's peer endpoint on an ephemeral loopback port
async fn serve_endpoint(node: &Node, shutdown: CancellationToken) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let endpoint = Arc::new(AssetEndpoint::new(
        Arc::clone(&node.engine),
        "/rrs/assetserver",
        "/rrs/register",
    ));
    tokio::spawn(server::serve(listener, endpoint, shutdown));
    addr
}

// =============================================================================
// Request Folding
// =============================================================================

mod folding_tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_misses_share_one_store_request() {
        let backend = InMemoryAssetStore::with_latency(Duration::from_millis(100));
        let asset = Asset::new(AssetId::random(), AssetType::TEXTURE, vec![9u8; 2048]);
        let id = asset.id;
        backend.insert(asset);
        let node = node_with(EngineConfig::default(), backend);

        let receivers: Vec<_> = (0..50).map(|_| node.engine.get_async(id, true)).collect();
        for rx in receivers {
            let asset = rx.await.unwrap().unwrap();
            assert_eq!(asset.id, id);
        }

        let stats = node.engine.stats();
        assert_eq!(stats.backend.reads, 1);
        assert_eq!(stats.metrics.upstream_requests, 1);
        assert_eq!(stats.metrics.folded_joins, 49);
        assert_eq!(stats.pending_groups, 0);

        // Served from memory from now on
        assert!(node.engine.get_cached(&id).is_some());
        let _ = node.engine.get_sync(id, true, Duration::from_secs(1)).await;
        assert_eq!(node.engine.stats().backend.reads, 1);
    }

    #[tokio::test]
    async fn test_waiters_and_transfers_fold_together() {
        let backend = InMemoryAssetStore::with_latency(Duration::from_millis(50));
        let asset = Asset::new(AssetId::random(), AssetType::SOUND, vec![1u8; 700]);
        let id = asset.id;
        backend.insert(asset);
        let node = node_with(EngineConfig::default(), backend);

        node.engine.request_transfer(direct_transfer(id)).unwrap();
        node.engine.request_transfer(direct_transfer(id)).unwrap();
        let waiter = node.engine.get_async(id, false);

        assert!(waiter.await.unwrap().is_some());
        wait_for("two deliveries", || node.transport.len() == 2).await;
        assert_eq!(node.backend.stats().reads, 1);
        assert!(node.transport.deliveries().iter().all(|d| d.is_found()));
    }

    #[tokio::test]
    async fn test_zero_ttl_refetches() {
        let backend = InMemoryAssetStore::new();
        let asset = Asset::new(AssetId::random(), AssetType::TEXTURE, vec![3u8; 10]);
        let id = asset.id;
        backend.insert(asset);
        let config = EngineConfig {
            entry_ttl: Duration::ZERO,
            ..EngineConfig::default()
        };
        let node = node_with(config, backend);

        assert!(node.engine.get_sync(id, true, Duration::from_secs(2)).await.is_some());
        assert!(node.engine.get_cached(&id).is_none());
        assert!(node.engine.get_sync(id, true, Duration::from_secs(2)).await.is_some());
        assert_eq!(node.backend.stats().reads, 2);
    }
}

// =============================================================================
// Writes and Admin
// =============================================================================

mod write_tests {
    use super::*;

    #[tokio::test]
    async fn test_first_put_wins() {
        let node = node();
        let id = AssetId::random();

        let first = Asset::new(id, AssetType::NOTECARD, b"first".to_vec());
        let second = Asset::new(id, AssetType::NOTECARD, b"second".to_vec());
        assert!(node.engine.put(first).await.unwrap());
        assert!(!node.engine.put(second).await.unwrap());

        let cached = node.engine.get_cached(&id).unwrap();
        assert_eq!(cached.data.as_ref(), b"first");
        assert_eq!(node.backend.stats().writes, 1);
        assert_eq!(node.engine.metrics().snapshot().duplicate_puts, 1);
    }

    #[tokio::test]
    async fn test_temporary_put_not_persisted() {
        let node = node();
        let asset = Asset::new(AssetId::random(), AssetType::TEXTURE, vec![1u8]).temporary(true);
        let id = asset.id;

        assert!(node.engine.put(asset).await.unwrap());
        assert!(node.engine.get_cached(&id).is_some());
        assert!(!node.backend.contains(&id));
    }

    #[tokio::test]
    async fn test_zero_id_rejected() {
        let node = node();
        let result = node
            .engine
            .put(Asset::new(AssetId::ZERO, AssetType::TEXTURE, vec![1u8]))
            .await;
        assert!(result.is_err());
        assert!(node
            .engine
            .get_sync(AssetId::ZERO, false, Duration::from_secs(1))
            .await
            .is_none());
        assert_eq!(node.backend.stats().reads, 0);
    }

    #[tokio::test]
    async fn test_clear_keeps_pending_requesters() {
        let backend = InMemoryAssetStore::with_latency(Duration::from_millis(100));
        let asset = Asset::new(AssetId::random(), AssetType::TEXTURE, vec![5u8; 5]);
        let id = asset.id;
        backend.insert(asset);
        let node = node_with(EngineConfig::default(), backend);

        let rx = node.engine.get_async(id, true);
        node.engine.clear();
        assert_eq!(node.engine.stats().pending_groups, 1);
        assert!(rx.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let node = node();
        assert!(node.engine.is_running());
        node.engine.shutdown().await;
        assert!(!node.engine.is_running());
    }
}

// =============================================================================
// Client Transfers
// =============================================================================

mod transfer_tests {
    use super::*;

    #[tokio::test]
    async fn test_transfer_packet_count() {
        let backend = InMemoryAssetStore::new();
        let asset = Asset::new(AssetId::random(), AssetType::TEXTURE, vec![0u8; 1500]);
        let id = asset.id;
        backend.insert(asset);
        let node = node_with(EngineConfig::default(), backend);

        node.engine.request_transfer(direct_transfer(id)).unwrap();
        wait_for("delivery", || node.transport.len() == 1).await;

        let delivery = node.transport.deliveries().remove(0);
        match &delivery.outcome {
            DeliveryOutcome::Found { packet_count, .. } => assert_eq!(*packet_count, 3),
            other => panic!("unexpected outcome {:?}", other),
        }
        let sizes: Vec<usize> = delivery.chunks().iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![600, 600, 300]);
    }

    #[tokio::test]
    async fn test_script_source_only_via_inventory() {
        let backend = InMemoryAssetStore::new();
        let script = Asset::new(AssetId::random(), AssetType::LSL_TEXT, b"default {}".to_vec());
        let id = script.id;
        backend.insert(script);
        let node = node_with(EngineConfig::default(), backend);

        let direct = direct_transfer(id);
        let direct_client = direct.client;
        node.engine.request_transfer(direct).unwrap();
        wait_for("direct delivery", || node.transport.len() == 1).await;

        let inventory = inventory_transfer(id);
        let inventory_client = inventory.client;
        node.engine.request_transfer(inventory).unwrap();
        wait_for("inventory delivery", || node.transport.len() == 2).await;

        let denied = node.transport.for_client(direct_client);
        assert!(matches!(denied[0].outcome, DeliveryOutcome::Denied));
        let granted = node.transport.for_client(inventory_client);
        assert!(granted[0].is_found());
    }

    #[tokio::test]
    async fn test_unknown_asset_without_peers() {
        let node = node();
        let id = AssetId::random();

        let started = Instant::now();
        assert!(node.engine.get_sync(id, false, Duration::from_secs(3)).await.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));

        node.engine.request_transfer(direct_transfer(id)).unwrap();
        wait_for("not-found delivery", || node.transport.len() == 1).await;
        assert!(matches!(
            node.transport.deliveries()[0].outcome,
            DeliveryOutcome::NotFound
        ));
    }

    #[test]
    fn test_malformed_transfer_params() {
        let short = TransferRequest::from_params(
            ClientHandle::random(),
            Uuid::new_v4(),
            3,
            Bytes::from(vec![0u8; 40]),
        );
        assert!(short.is_err());

        let unknown_source = TransferRequest::from_params(
            ClientHandle::random(),
            Uuid::new_v4(),
            9,
            Bytes::from(vec![0u8; 96]),
        );
        assert!(unknown_source.is_err());
    }
}

// =============================================================================
// Peer Fallback over HTTP
// =============================================================================

mod peer_tests {
    use super::*;

    #[tokio::test]
    async fn test_asset_found_on_peer() {
        let shutdown = CancellationToken::new();

        let remote = node();
        let asset = Asset::new(AssetId::random(), AssetType::OBJECT, vec![42u8; 1234])
            .with_name("crate")
            .with_description("wooden <crate>");
        let id = asset.id;
        remote.backend.insert(asset);
        let remote_addr = serve_endpoint(&remote, shutdown.clone()).await;

        let local = node();
        local
            .engine
            .resolver()
            .register_peer("127.0.0.1", remote_addr.port(), "/rrs/assetserver");

        let found = local
            .engine
            .get_sync(id, false, Duration::from_secs(5))
            .await
            .expect("asset from peer");
        assert_eq!(found.data.len(), 1234);
        assert_eq!(found.name, "crate");
        assert_eq!(found.description, "wooden <crate>");
        assert!(found.temporary);
        assert!(found.local);

        assert!(local.engine.get_cached(&id).is_some());
        assert!(local.backend.contains(&id));
        assert_eq!(local.engine.metrics().snapshot().peer_hits, 1);

        // A loopback requester is this host; it must not become a peer
        assert!(!remote.engine.resolver().registry().contains("127.0.0.1", 9999));
        assert_eq!(remote.engine.resolver().peer_count(), 0);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_peer_miss_is_not_escalated() {
        let shutdown = CancellationToken::new();

        let remote = node();
        let remote_addr = serve_endpoint(&remote, shutdown.clone()).await;

        let local = node();
        local
            .engine
            .resolver()
            .register_peer("127.0.0.1", remote_addr.port(), "/rrs/assetserver");

        let id = AssetId::random();
        assert!(local.engine.get_sync(id, true, Duration::from_secs(5)).await.is_none());

        let local_metrics = local.engine.metrics().snapshot();
        assert_eq!(local_metrics.peer_lookups, 1);
        assert_eq!(local_metrics.peer_misses, 1);
        assert_eq!(local_metrics.peer_errors, 0);

        // The serving node answered from its own store only
        assert_eq!(remote.engine.metrics().snapshot().peer_lookups, 0);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_announce_registers_on_peer() {
        let shutdown = CancellationToken::new();

        let remote = node();
        let remote_addr = serve_endpoint(&remote, shutdown.clone()).await;

        let local = node();
        local
            .engine
            .resolver()
            .register_peer("127.0.0.1", remote_addr.port(), "/rrs/assetserver");

        let accepted = local.engine.resolver().announce("10.9.8.7", 7777).await;
        assert_eq!(accepted, 1);
        assert!(remote.engine.resolver().registry().contains("10.9.8.7", 7777));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_endpoint_status_codes() {
        let shutdown = CancellationToken::new();
        let remote = node();
        let addr = serve_endpoint(&remote, shutdown.clone()).await;
        let http = reqwest::Client::new();

        let status = |path: &'static str| {
            let http = http.clone();
            async move {
                http.get(format!("http://{}{}", addr, path))
                    .send()
                    .await
                    .unwrap()
                    .status()
                    .as_u16()
            }
        };

        assert_eq!(status("/rrs/assetserver?asset=not-a-uuid").await, 400);
        assert_eq!(status("/rrs/register?ip=10.0.0.1").await, 400);
        assert_eq!(status("/rrs/register?ip=10.0.0.1&port=8000").await, 200);
        assert_eq!(status("/unknown").await, 404);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unreachable_peer_counts_error() {
        // Bind then drop to get a port with nothing listening
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let local = node();
        local
            .engine
            .resolver()
            .register_peer("127.0.0.1", port, "/rrs/assetserver");

        assert!(local
            .engine
            .get_sync(AssetId::random(), false, Duration::from_secs(5))
            .await
            .is_none());
        assert_eq!(local.engine.metrics().snapshot().peer_errors, 1);
    }
}
