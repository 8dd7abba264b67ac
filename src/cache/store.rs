//! Content Store - In-Memory Asset Tier
//!
//! Map from asset id to cached asset with a per-entry lifetime.
//!
//! # Design
//!
//! - Single coarse lock around a `HashMap`; this tier is not on a per-frame path
//! - Lookups never mutate: an expired entry reads as absent and is dropped by
//!   the next write to the same key or by [`ContentStore::purge_expired`]
//! - Replacing an existing key is allowed (last write wins)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::DEFAULT_ENTRY_TTL;
use crate::asset::{Asset, AssetId};

/// Cached asset plus its lifetime
#[derive(Clone)]
pub struct CacheEntry {
    asset: Arc<Asset>,
    inserted_at: Instant,
    lifetime: Duration,
}

impl CacheEntry {
    /// Create a new entry starting its lifetime now
    pub fn new(asset: Arc<Asset>, lifetime: Duration) -> Self {
        Self {
            asset,
            inserted_at: Instant::now(),
            lifetime,
        }
    }

    /// Cached asset
    #[inline]
    pub fn asset(&self) -> &Arc<Asset> {
        &self.asset
    }

    /// Time-to-live from insertion
    #[inline]
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Time since insertion
    #[inline]
    pub fn age(&self) -> Duration {
        self.inserted_at.elapsed()
    }

    /// A zero lifetime expires immediately
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.age() >= self.lifetime
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("id", &self.asset.id)
            .field("size", &self.asset.len())
            .field("lifetime", &self.lifetime)
            .field("is_expired", &self.is_expired())
            .finish()
    }
}

/// In-memory asset tier
pub struct ContentStore {
    entries: Mutex<HashMap<AssetId, CacheEntry>>,
    default_ttl: Duration,
}

impl ContentStore {
    /// Create a store using the default 24 hour lifetime
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_ENTRY_TTL)
    }

    /// Create a store with a custom default lifetime
    pub fn with_ttl(default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Default lifetime applied by [`insert_if_absent`](Self::insert_if_absent)
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up a live entry
    pub fn try_get(&self, id: &AssetId) -> Option<Arc<Asset>> {
        let entries = self.entries.lock();
        entries
            .get(id)
            .filter(|entry| !entry.is_expired())
            .map(|entry| Arc::clone(entry.asset()))
    }

    /// Insert or replace an entry, returning the previous live asset if any
    pub fn put(&self, id: AssetId, asset: Arc<Asset>, ttl: Duration) -> Option<Arc<Asset>> {
        let mut entries = self.entries.lock();
        entries
            .insert(id, CacheEntry::new(asset, ttl))
            .filter(|old| !old.is_expired())
            .map(|old| old.asset)
    }

    /// Insert with the default lifetime unless a live entry exists.
    ///
    /// Returns the asset now cached under `id` and whether this call inserted it.
    pub fn insert_if_absent(&self, id: AssetId, asset: Arc<Asset>) -> (Arc<Asset>, bool) {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&id).filter(|e| !e.is_expired()) {
            return (Arc::clone(existing.asset()), false);
        }
        entries.insert(id, CacheEntry::new(Arc::clone(&asset), self.default_ttl));
        (asset, true)
    }

    /// Remove an entry; absent keys are a no-op
    pub fn remove(&self, id: &AssetId) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    /// Check for a live entry
    pub fn contains(&self, id: &AssetId) -> bool {
        self.entries
            .lock()
            .get(id)
            .map(|entry| !entry.is_expired())
            .unwrap_or(false)
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        before - entries.len()
    }

    /// Number of stored entries (including expired ones not yet purged)
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Total payload bytes held
    pub fn size_bytes(&self) -> u64 {
        self.entries
            .lock()
            .values()
            .map(|entry| entry.asset().len() as u64)
            .sum()
    }
}

impl Default for ContentStore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
