//! Asset Cache Engine
//!
//! Orchestrates the memory tier, request folding, the durable store and
//! peer fallback.
//!
//! ```text
//!  get_async ──hit──────────────────────────────────────────▶ reply
//!     │miss
//!     ▼
//!  RequestFoldingTable ──first──▶ AssetStore::request_asset
//!                                    │found          │missing / error
//!                                    ▼               ▼
//!                               on_resolved     on_unresolved
//!                                    │          ┌────┴─────────┐
//!                                    │     region queue   client queue
//!                                    │          └────┬─────────┘ (one per group)
//!                                    │       PeerAssetResolver::lookup
//!                                    ▼               ▼
//!                         waiters: reply    transfers: delivery queue ──▶ AssetTransport
//! ```
//!
//! Every requester is answered exactly once, with the asset or `None`.
//! The only exception is process shutdown: items still queued when the
//! workers stop are abandoned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::backend::{AssetStore, AssetStoreStats};
use super::delivery::{AssetDelivery, AssetTransport, TransferRequest};
use super::folding::{PendingRequestGroup, Requester, RequestFoldingTable};
use super::metrics::{CacheMetrics, MetricsSnapshot};
use super::queue::WorkQueue;
use super::store::ContentStore;
use super::DEFAULT_ENTRY_TTL;
use crate::asset::{Asset, AssetId};
use crate::error::{Error, Result};
use crate::peer::PeerAssetResolver;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lifetime of memory-tier entries
    pub entry_ttl: Duration,
    /// Workers draining the delivery queue
    pub delivery_workers: usize,
    /// Workers draining the deferred-region queue
    pub region_workers: usize,
    /// Workers draining the deferred-client queue
    pub client_workers: usize,
    /// Default bound for synchronous lookups
    pub sync_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            entry_ttl: DEFAULT_ENTRY_TTL,
            delivery_workers: 1,
            region_workers: 1,
            client_workers: 1,
            sync_timeout: Duration::from_millis(3000),
        }
    }
}

/// Point-in-time engine state
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub cached_assets: usize,
    pub cached_bytes: u64,
    pub pending_groups: usize,
    pub pending_requesters: usize,
    pub delivery_queue: usize,
    pub region_queue: usize,
    pub client_queue: usize,
    pub peers: usize,
    pub backend: AssetStoreStats,
    pub metrics: MetricsSnapshot,
}

/// The asset cache
pub struct AssetCacheEngine {
    config: EngineConfig,
    store: ContentStore,
    folding: RequestFoldingTable,
    backend: Arc<dyn AssetStore>,
    resolver: Arc<PeerAssetResolver>,
    transport: Arc<dyn AssetTransport>,
    metrics: CacheMetrics,

    delivery_queue: WorkQueue<AssetDelivery>,
    region_queue: WorkQueue<PendingRequestGroup>,
    client_queue: WorkQueue<PendingRequestGroup>,

    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl AssetCacheEngine {
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn AssetStore>,
        resolver: Arc<PeerAssetResolver>,
        transport: Arc<dyn AssetTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: ContentStore::with_ttl(config.entry_ttl),
            folding: RequestFoldingTable::new(),
            backend,
            resolver,
            transport,
            metrics: CacheMetrics::new(),
            delivery_queue: WorkQueue::new("delivery"),
            region_queue: WorkQueue::new("deferred-region"),
            client_queue: WorkQueue::new("deferred-client"),
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<PeerAssetResolver> {
        &self.resolver
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the worker pools. Calling twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut handles = Vec::new();

        let engine = Arc::clone(self);
        handles.extend(self.delivery_queue.spawn_workers(
            self.config.delivery_workers,
            self.cancel.clone(),
            move |delivery| {
                let engine = Arc::clone(&engine);
                async move { engine.deliver(delivery).await }
            },
        ));

        for (queue, workers) in [
            (&self.region_queue, self.config.region_workers),
            (&self.client_queue, self.config.client_workers),
        ] {
            let engine = Arc::clone(self);
            handles.extend(queue.spawn_workers(workers, self.cancel.clone(), move |group| {
                let engine = Arc::clone(&engine);
                async move { engine.process_deferred(group).await }
            }));
        }

        info!(
            delivery = self.config.delivery_workers,
            region = self.config.region_workers,
            client = self.config.client_workers,
            "Asset cache workers started"
        );
        self.workers.lock().extend(handles);
    }

    /// Stop the worker pools and wait for them to exit
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("Asset cache workers stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Memory tier only
    pub fn get_cached(&self, id: &AssetId) -> Option<Arc<Asset>> {
        if id.is_zero() {
            self.metrics.record_invalid_request();
            return None;
        }
        let asset = self.store.try_get(id);
        match asset {
            Some(_) => self.metrics.record_hit(),
            None => self.metrics.record_miss(),
        }
        asset
    }

    /// Resolve an asset, allowing peer fallback
    pub fn get_async(
        self: &Arc<Self>,
        id: AssetId,
        is_texture: bool,
    ) -> oneshot::Receiver<Option<Arc<Asset>>> {
        self.get_async_with(id, is_texture, true)
    }

    /// Resolve an asset; non-retryable requesters never reach the peers.
    ///
    /// A hit is answered before this returns. Must be called inside a Tokio
    /// runtime.
    pub fn get_async_with(
        self: &Arc<Self>,
        id: AssetId,
        is_texture: bool,
        retryable: bool,
    ) -> oneshot::Receiver<Option<Arc<Asset>>> {
        let (tx, rx) = oneshot::channel();

        if id.is_zero() {
            self.metrics.record_invalid_request();
            debug!("Rejected lookup for zero asset id");
            let _ = tx.send(None);
            return rx;
        }

        if let Some(asset) = self.store.try_get(&id) {
            self.metrics.record_hit();
            let _ = tx.send(Some(asset));
            return rx;
        }

        self.metrics.record_miss();
        self.fold(id, is_texture, Requester::waiter(tx, retryable));
        rx
    }

    /// [`get_async`](Self::get_async) with a bounded wait.
    ///
    /// A timeout abandons the wait only; the fetch keeps running and will
    /// populate the cache.
    pub async fn get_sync(
        self: &Arc<Self>,
        id: AssetId,
        is_texture: bool,
        timeout: Duration,
    ) -> Option<Arc<Asset>> {
        self.get_sync_with(id, is_texture, true, timeout).await
    }

    #[instrument(skip(self, timeout))]
    pub async fn get_sync_with(
        self: &Arc<Self>,
        id: AssetId,
        is_texture: bool,
        retryable: bool,
        timeout: Duration,
    ) -> Option<Arc<Asset>> {
        let reply = self.get_async_with(id, is_texture, retryable);
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(asset)) => asset,
            Ok(Err(_)) => {
                warn!("Resolution dropped without a reply");
                None
            }
            Err(_) => {
                debug!(?timeout, "Synchronous lookup timed out");
                None
            }
        }
    }

    /// Queue a client transfer.
    ///
    /// A hit goes straight to the delivery queue; a miss folds into the
    /// pending fetch for the asset.
    pub fn request_transfer(self: &Arc<Self>, request: TransferRequest) -> Result<()> {
        let id = request.asset_id;
        if id.is_zero() {
            self.metrics.record_invalid_request();
            return Err(Error::InvalidRequest(format!(
                "transfer {} names the zero asset id",
                request.transfer_id
            )));
        }

        if let Some(asset) = self.store.try_get(&id) {
            self.metrics.record_hit();
            return self
                .delivery_queue
                .enqueue(AssetDelivery::resolved(request, asset));
        }

        self.metrics.record_miss();
        let is_texture = request.is_texture;
        self.fold(id, is_texture, Requester::Transfer(request));
        Ok(())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert an asset.
    ///
    /// Returns `false` when the id is already cached (first writer wins).
    /// Persistent assets are forwarded to the durable store; a store failure
    /// is logged and does not undo the insert.
    #[instrument(skip(self, asset), fields(id = %asset.id))]
    pub async fn put(&self, asset: Asset) -> Result<bool> {
        if asset.id.is_zero() {
            self.metrics.record_invalid_request();
            return Err(Error::InvalidRequest("cannot store the zero asset id".into()));
        }

        let persist = asset.should_persist();
        let (cached, inserted) = self.store.insert_if_absent(asset.id, Arc::new(asset));
        if !inserted {
            self.metrics.record_duplicate_put();
            debug!("Asset already cached, ignoring put");
            return Ok(false);
        }
        self.metrics.record_put();

        if persist {
            if let Err(e) = self.backend.store_asset(&cached).await {
                warn!(error = %e, "Failed to persist asset");
            }
        }

        if let Some(group) = self.folding.take_and_clear(&cached.id) {
            self.complete_group(group, Some(cached));
        }
        Ok(true)
    }

    // =========================================================================
    // Admin
    // =========================================================================

    /// Drop one entry from the memory tier
    pub fn expire(&self, id: &AssetId) -> bool {
        self.store.remove(id)
    }

    /// Drop the memory tier and reset counters; pending fetches are kept
    pub fn clear(&self) {
        self.store.clear();
        self.metrics.reset();
        info!("Asset cache cleared");
    }

    pub fn purge_expired(&self) -> usize {
        let purged = self.store.purge_expired();
        if purged > 0 {
            debug!(purged, "Purged expired entries");
        }
        purged
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            cached_assets: self.store.len(),
            cached_bytes: self.store.size_bytes(),
            pending_groups: self.folding.len(),
            pending_requesters: self.folding.pending_requesters(),
            delivery_queue: self.delivery_queue.len(),
            region_queue: self.region_queue.len(),
            client_queue: self.client_queue.len(),
            peers: self.resolver.peer_count(),
            backend: self.backend.stats(),
            metrics: self.metrics.snapshot(),
        }
    }

    // =========================================================================
    // Durable store callbacks
    // =========================================================================

    /// The durable store found the asset
    pub fn on_resolved(&self, asset: Asset, is_texture: bool) {
        self.metrics.record_store_resolved();
        let id = asset.id;
        let (cached, _) = self.store.insert_if_absent(id, Arc::new(asset));
        debug!(%id, is_texture, "Resolved from asset store");

        if let Some(group) = self.folding.take_and_clear(&id) {
            self.complete_group(group, Some(cached));
        }
    }

    /// The durable store does not have the asset; defer to the peers
    pub fn on_unresolved(&self, id: AssetId, is_texture: bool) {
        self.metrics.record_store_unresolved();
        let Some(group) = self.folding.take_and_clear(&id) else {
            return;
        };
        debug!(%id, is_texture, requesters = group.len(), "Deferring unresolved request");

        // One peer pass per group; notify routes transfers to delivery
        let (queue, name) = if group.opened_by_transfer() {
            (&self.client_queue, "client")
        } else {
            (&self.region_queue, "region")
        };
        if let Err(e) = queue.enqueue(group) {
            error!(%id, queue = name, error = %e, "Failed to defer request group");
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn fold(self: &Arc<Self>, id: AssetId, is_texture: bool, requester: Requester) {
        if !self.folding.register_or_join(id, is_texture, requester) {
            self.metrics.record_folded_join();
            return;
        }

        // A resolution may have landed between the miss and the registration
        if let Some(asset) = self.store.try_get(&id) {
            if let Some(group) = self.folding.take_and_clear(&id) {
                self.complete_group(group, Some(asset));
            }
            return;
        }

        self.dispatch_fetch(id, is_texture);
    }

    fn dispatch_fetch(self: &Arc<Self>, id: AssetId, is_texture: bool) {
        self.metrics.record_upstream_request();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.backend.request_asset(id, is_texture).await {
                Ok(Some(asset)) if asset.id == id => engine.on_resolved(asset, is_texture),
                Ok(Some(asset)) => {
                    warn!(%id, returned = %asset.id, "Asset store returned the wrong asset");
                    engine.on_unresolved(id, is_texture);
                }
                Ok(None) => engine.on_unresolved(id, is_texture),
                Err(e) => {
                    if e.is_transient() {
                        warn!(%id, error = %e, "Asset store request failed");
                    } else {
                        error!(%id, error = %e, "Asset store request failed");
                    }
                    engine.on_unresolved(id, is_texture);
                }
            }
        });
    }

    fn complete_group(&self, group: PendingRequestGroup, asset: Option<Arc<Asset>>) {
        self.metrics.record_miss_latency(group.age());
        for requester in group.into_requesters() {
            self.notify(requester, asset.clone());
        }
    }

    fn notify(&self, requester: Requester, asset: Option<Arc<Asset>>) {
        match requester {
            Requester::Waiter { reply, .. } => {
                // The waiter may have timed out already
                let _ = reply.send(asset);
            }
            Requester::Transfer(request) => {
                let delivery = AssetDelivery::from_lookup(request, asset);
                if let Err(e) = self.delivery_queue.enqueue(delivery) {
                    error!(error = %e, "Failed to queue delivery");
                }
            }
        }
    }

    async fn process_deferred(&self, group: PendingRequestGroup) {
        let id = group.id();
        let is_texture = group.is_texture();
        let started = group.first_requested_at();

        let (retryable, non_retryable) = group.partition_retryable();
        for requester in non_retryable {
            self.notify(requester, None);
        }
        if retryable.is_empty() {
            return;
        }

        let asset = self.resolve_elsewhere(id, is_texture).await;
        self.metrics.record_miss_latency(started.elapsed());
        for requester in retryable {
            self.notify(requester, asset.clone());
        }
    }

    #[instrument(skip(self))]
    async fn resolve_elsewhere(&self, id: AssetId, is_texture: bool) -> Option<Arc<Asset>> {
        if let Some(asset) = self.store.try_get(&id) {
            return Some(asset);
        }

        self.metrics.record_peer_lookup();
        let lookup = self.resolver.lookup(id, is_texture).await;
        self.metrics.record_peer_errors(lookup.errors as u64);

        let Some(asset) = lookup.asset else {
            self.metrics.record_peer_miss();
            debug!(attempted = lookup.attempted, "Asset not found on any peer");
            return None;
        };
        self.metrics.record_peer_hit();

        let (cached, inserted) = self.store.insert_if_absent(id, Arc::new(asset));
        if inserted {
            if let Err(e) = self.backend.store_asset(&cached).await {
                warn!(error = %e, "Failed to persist peer asset");
            }
        }
        Some(cached)
    }

    async fn deliver(&self, delivery: AssetDelivery) {
        let client = delivery.request.client;
        let asset = delivery.request.asset_id;
        match self.transport.deliver(delivery).await {
            Ok(()) => self.metrics.record_delivery(),
            Err(e) => {
                self.metrics.record_delivery_failure();
                warn!(%client, %asset, error = %e, "Asset delivery failed");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
