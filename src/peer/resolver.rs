//! Peer Asset Resolver
//!
//! Cross-grid fallback for assets the local durable store does not hold.
//!
//! ```text
//!   lookup(id) ──▶ snapshot ──▶ peer A ──timeout──▶ skip
//!                               peer B ──404──────▶ skip
//!                               peer C ──200──────▶ return
//! ```
//!
//! Peers are tried one at a time in registration order, and the first
//! positive answer wins. A failing peer is skipped and only leaves the
//! registry once it has failed enough times in a row.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, info, instrument, warn};

use super::registry::{
    PeerRegistry, PeerServerRecord, RegisterOutcome, DEFAULT_ASSET_PREFIX, DEFAULT_PEER_PORT,
    DEFAULT_REGISTER_PREFIX,
};
use super::wire;
use crate::asset::{Asset, AssetId};
use crate::error::{Error, Result};

/// Outbound peer protocol
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Fetch an asset; `Ok(None)` when the peer answers "not found"
    async fn fetch(&self, peer: &PeerServerRecord, id: AssetId, is_texture: bool)
        -> Result<Option<Asset>>;

    /// Announce `(address, port)` to a peer
    async fn announce(
        &self,
        peer: &PeerServerRecord,
        register_prefix: &str,
        address: &str,
        port: u16,
    ) -> Result<()>;
}

/// HTTP peer client
pub struct HttpPeerClient {
    http: reqwest::Client,
    dump: bool,
}

impl HttpPeerClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::PeerTransport)?;
        Ok(Self { http, dump: false })
    }

    /// Log every response body at debug level
    pub fn with_dump(mut self, dump: bool) -> Self {
        self.dump = dump;
        self
    }

    fn transport_error(peer: &PeerServerRecord, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::PeerTimeout {
                peer: peer.to_string(),
            }
        } else {
            Error::PeerTransport(err)
        }
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn fetch(
        &self,
        peer: &PeerServerRecord,
        id: AssetId,
        is_texture: bool,
    ) -> Result<Option<Asset>> {
        let url = peer.asset_url(id, is_texture);
        debug!(%url, "Sending peer request");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::transport_error(peer, e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Error::PeerStatus {
                peer: peer.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| Self::transport_error(peer, e))?;
        if self.dump {
            debug!(peer = %peer, %body, "Peer response");
        }

        wire::decode_asset(&body, id).map(Some)
    }

    async fn announce(
        &self,
        peer: &PeerServerRecord,
        register_prefix: &str,
        address: &str,
        port: u16,
    ) -> Result<()> {
        let url = peer.register_url(register_prefix, address, port);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::transport_error(peer, e))?;

        if !response.status().is_success() {
            return Err(Error::PeerStatus {
                peer: peer.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Resolver settings
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Budget for one peer call
    pub peer_timeout: Duration,
    /// Port assumed for self-registered and prefix-less peers
    pub default_port: u16,
    /// Asset prefix assumed for self-registered peers
    pub asset_prefix: String,
    /// Prefix used when announcing this node
    pub register_prefix: String,
    pub max_peers: usize,
    /// Consecutive failures before eviction (0 disables)
    pub max_peer_failures: u32,
    /// Names and addresses of this node, never self-registered
    pub local_addresses: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            peer_timeout: Duration::from_secs(10),
            default_port: DEFAULT_PEER_PORT,
            asset_prefix: DEFAULT_ASSET_PREFIX.to_string(),
            register_prefix: DEFAULT_REGISTER_PREFIX.to_string(),
            max_peers: 64,
            max_peer_failures: 5,
            local_addresses: Vec::new(),
        }
    }
}

/// Outcome of one pass over the peer list
#[derive(Debug, Default)]
pub struct PeerLookup {
    pub asset: Option<Asset>,
    /// Peer that answered with the asset
    pub source: Option<PeerServerRecord>,
    /// Peers contacted
    pub attempted: usize,
    /// Peers that failed (timeout, transport, status, malformed)
    pub errors: usize,
}

impl PeerLookup {
    pub fn is_found(&self) -> bool {
        self.asset.is_some()
    }
}

/// Resolves assets from peer cache nodes
pub struct PeerAssetResolver {
    registry: PeerRegistry,
    client: Arc<dyn PeerClient>,
    config: ResolverConfig,
}

impl PeerAssetResolver {
    pub fn new(client: Arc<dyn PeerClient>, config: ResolverConfig) -> Self {
        Self {
            registry: PeerRegistry::new(config.max_peers, config.max_peer_failures),
            client,
            config,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Try each known peer in registration order until one has the asset.
    ///
    /// Peer-found assets are marked temporary and local.
    #[instrument(skip(self), fields(peers = self.registry.len()))]
    pub async fn lookup(&self, id: AssetId, is_texture: bool) -> PeerLookup {
        let mut outcome = PeerLookup::default();
        if id.is_zero() {
            return outcome;
        }

        for peer in self.registry.snapshot() {
            outcome.attempted += 1;

            let result = match tokio::time::timeout(
                self.config.peer_timeout,
                self.client.fetch(&peer, id, is_texture),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::PeerTimeout {
                    peer: peer.to_string(),
                }),
            };

            match result {
                Ok(Some(asset)) => {
                    self.registry.record_success(&peer);
                    debug!(peer = %peer, "Asset found on peer");
                    outcome.asset = Some(asset.temporary(true).local(true));
                    outcome.source = Some(peer);
                    return outcome;
                }
                Ok(None) => {
                    self.registry.record_success(&peer);
                    debug!(peer = %peer, "Peer does not hold asset");
                }
                Err(e) => {
                    outcome.errors += 1;
                    warn!(peer = %peer, error = %e, "Peer lookup failed");
                    if self.registry.record_failure(&peer) {
                        info!(peer = %peer, "Evicted unresponsive peer");
                    }
                }
            }
        }

        outcome
    }

    /// Register a peer by address, port and prefix
    pub fn register_peer(
        &self,
        address: &str,
        port: u16,
        path_prefix: &str,
    ) -> RegisterOutcome {
        let outcome = self
            .registry
            .register(PeerServerRecord::new(address, port, path_prefix));
        match outcome {
            RegisterOutcome::Added => info!(address, port, path_prefix, "Registered peer"),
            RegisterOutcome::Full => warn!(address, port, "Peer registry full, ignoring peer"),
            RegisterOutcome::AlreadyKnown => {}
        }
        outcome
    }

    /// Register a peer record as-is
    pub fn register_record(&self, record: PeerServerRecord) -> RegisterOutcome {
        let (address, port, prefix) = (record.address, record.port, record.path_prefix);
        self.register_peer(&address, port, &prefix)
    }

    /// Self-registration of an inbound requester at the well-known port.
    ///
    /// Loopback, unspecified and configured local addresses are ignored.
    pub fn note_inbound(&self, address: &str) -> bool {
        if self.is_local(address) {
            debug!(address, "Ignoring inbound request from this node");
            return false;
        }
        if self.registry.contains(address, self.config.default_port) {
            return false;
        }
        let outcome = self.register_peer(
            address,
            self.config.default_port,
            &self.config.asset_prefix,
        );
        outcome == RegisterOutcome::Added
    }

    fn is_local(&self, address: &str) -> bool {
        let host = address.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            let ip = ip.to_canonical();
            if ip.is_loopback() || ip.is_unspecified() {
                return true;
            }
        }
        host.eq_ignore_ascii_case("localhost")
            || self
                .config
                .local_addresses
                .iter()
                .any(|local| local.eq_ignore_ascii_case(host))
    }

    /// Announce this node to every known peer; returns how many accepted
    pub async fn announce(&self, address: &str, port: u16) -> usize {
        let mut accepted = 0;
        for peer in self.registry.snapshot() {
            match self
                .client
                .announce(&peer, &self.config.register_prefix, address, port)
                .await
            {
                Ok(()) => {
                    accepted += 1;
                    debug!(peer = %peer, "Announced to peer");
                }
                Err(e) => warn!(peer = %peer, error = %e, "Peer announcement failed"),
            }
        }
        accepted
    }

    pub fn peers(&self) -> Vec<PeerServerRecord> {
        self.registry.snapshot()
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
