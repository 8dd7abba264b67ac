//! GridCache - Distributed Asset Cache for Grid-Hosted Virtual Worlds
//!
//! Each simulator node keeps an in-memory tier of immutable assets (textures,
//! sounds, scripts, ...) in front of a durable asset store. Concurrent
//! requests for the same id are folded into one upstream fetch, and assets
//! the durable store cannot supply are looked up on peer cache nodes.
//!
//! # Architecture
//!
//! ```text
//!   viewer transfers        in-process callers        peer nodes
//!          │                       │                      │
//!          ▼                       ▼                      ▼
//! ┌──────────────────────────────────────────┐   ┌─────────────────┐
//! │            AssetCacheEngine              │◀──│  AssetEndpoint  │
//! │  ContentStore → folding → AssetStore     │   └─────────────────┘
//! │                    │                     │
//! │                    ▼ (unresolved)        │
//! │            PeerAssetResolver ────────────┼──▶ other nodes' endpoints
//! └──────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`asset`] - Asset identity and payload
//! - [`cache`] - Memory tier, request folding, worker queues and the engine
//! - [`config`] - Node configuration and peer file
//! - [`error`] - Error types
//! - [`peer`] - Peer registry, resolver and wire codec
//! - [`server`] - Peer endpoint and admin surface

pub mod asset;
pub mod cache;
pub mod config;
pub mod error;
pub mod peer;
pub mod server;

pub use asset::{Asset, AssetId, AssetType};
pub use cache::{
    AssetCacheEngine, AssetStore, AssetTransport, CacheStats, EngineConfig, InMemoryAssetStore,
    TransferRequest,
};
pub use config::NodeConfig;
pub use error::{Error, Result};
pub use peer::{HttpPeerClient, PeerAssetResolver, PeerClient, PeerServerRecord, ResolverConfig};
pub use server::{AdminEndpoint, AssetEndpoint, HealthCheck};
