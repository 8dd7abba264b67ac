//! Distributed Asset Cache
//!
//! In-memory asset tier fronting a durable asset store, with request
//! folding and a peer-fallback pipeline.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                         AssetCacheEngine                                 │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  ContentStore         │ RequestFoldingTable  │ AssetStore (durable)      │
//! │  ┌────────────────┐   │ ┌────────────────┐   │ ┌────────────────────┐    │
//! │  │ HashMap + TTL  │   │ │ one group per  │   │ │ request_asset      │    │
//! │  │ (24h default)  │   │ │ asset id       │   │ │ store_asset        │    │
//! │  └────────────────┘   │ └────────────────┘   │ └────────────────────┘    │
//! │         │             │         │            │           │               │
//! │         └─────────────┴─────────┴────────────┴───────────┘               │
//! │                              │                                           │
//! │        delivery queue │ deferred-region queue │ deferred-client queue    │
//! │                       (fixed worker pools per queue)                     │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - At most one outstanding durable-store request per asset id
//! - A single peer-fallback pass per failed group, no further retry
//! - Store and peer failures degrade to "not found", never to a hung caller
//! - Assets are immutable once cached; the first writer wins

use std::time::Duration;

pub mod backend;
pub mod delivery;
pub mod engine;
pub mod folding;
pub mod metrics;
pub mod queue;
pub mod store;

#[cfg(test)]
mod proptest;

/// Default lifetime of a memory-tier entry
pub const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Payload bytes per transfer packet
pub const MAX_PACKET_SIZE: usize = 600;

pub use backend::{AssetStore, AssetStoreStats, InMemoryAssetStore};
pub use delivery::{
    packet_count, AssetDelivery, AssetTransport, ClientHandle, DeliveryOutcome,
    InMemoryTransport, LoggingTransport, TransferRequest, TransferSource,
};
pub use engine::{AssetCacheEngine, CacheStats, EngineConfig};
pub use folding::{PendingRequestGroup, RequestFoldingTable, Requester};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use queue::WorkQueue;
pub use store::{CacheEntry, ContentStore};
