//! Persistent Asset Store Port
//!
//! The durable store behind the memory tier. The engine issues
//! `request_asset` once per folded miss and `store_asset` for assets that
//! should outlive this process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;

use crate::asset::{Asset, AssetId};
use crate::error::Result;

/// Durable asset store
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Fetch an asset; `Ok(None)` when the store does not hold it
    async fn request_asset(&self, id: AssetId, is_texture: bool) -> Result<Option<Asset>>;

    /// Persist an asset
    async fn store_asset(&self, asset: &Asset) -> Result<()>;

    /// Get storage statistics
    fn stats(&self) -> AssetStoreStats;
}

/// Durable store statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct AssetStoreStats {
    /// Total assets held
    pub asset_count: u64,
    /// Total payload bytes held
    pub total_bytes: u64,
    /// Read operations
    pub reads: u64,
    /// Reads that found nothing
    pub misses: u64,
    /// Write operations
    pub writes: u64,
}

/// In-memory durable store.
///
/// Stands in for a real asset service in the binary and in tests.
#[derive(Default)]
pub struct InMemoryAssetStore {
    assets: DashMap<AssetId, Asset>,
    latency: Option<Duration>,
    total_bytes: AtomicU64,
    reads: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl InMemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every read to simulate a remote service
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Seed an asset without counting a write
    pub fn insert(&self, asset: Asset) {
        self.account(&asset);
        self.assets.insert(asset.id, asset);
    }

    pub fn contains(&self, id: &AssetId) -> bool {
        self.assets.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    fn account(&self, asset: &Asset) {
        let size = asset.len() as u64;
        if let Some(old) = self.assets.get(&asset.id) {
            self.total_bytes
                .fetch_sub(old.len() as u64, Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
    }
}

#[async_trait]
impl AssetStore for InMemoryAssetStore {
    async fn request_asset(&self, id: AssetId, _is_texture: bool) -> Result<Option<Asset>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let found = self.assets.get(&id).map(|entry| entry.value().clone());
        if found.is_none() {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    async fn store_asset(&self, asset: &Asset) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.account(asset);
        self.assets.insert(asset.id, asset.clone());
        Ok(())
    }

    fn stats(&self) -> AssetStoreStats {
        AssetStoreStats {
            asset_count: self.assets.len() as u64,
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
