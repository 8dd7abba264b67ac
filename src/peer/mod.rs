//! Peer Resolution
//!
//! Cache nodes pull assets from each other over a small HTTP protocol.
//!
//! ```text
//! ┌──────────────────────┐   GET {prefix}?asset=..&texture=..   ┌───────────────┐
//! │  PeerAssetResolver   │ ───────────────────────────────────▶ │  peer node    │
//! │  (registry snapshot) │ ◀─────────── <body><asset>…          │  endpoint     │
//! └──────────────────────┘                                       └───────────────┘
//! ```

pub mod registry;
pub mod resolver;
pub mod wire;

pub use registry::{
    PeerRegistry, PeerServerRecord, RegisterOutcome, DEFAULT_ASSET_PREFIX, DEFAULT_PEER_PORT,
    DEFAULT_REGISTER_PREFIX,
};
pub use resolver::{HttpPeerClient, PeerAssetResolver, PeerClient, PeerLookup, ResolverConfig};
pub use wire::{decode_asset, encode_asset, encode_legacy, WIRE_VERSION};
