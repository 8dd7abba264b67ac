//! Peer Registry
//!
//! Bounded, insertion-ordered list of peer cache nodes.
//!
//! # Design
//!
//! - Lookups iterate a snapshot, so no lock is held across network calls
//! - De-duplicated by address and port
//! - A peer that fails `max_failures` times in a row is evicted; any
//!   well-formed answer resets its count

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::asset::AssetId;
use crate::error::{Error, Result};

/// Well-known peer port
pub const DEFAULT_PEER_PORT: u16 = 9999;

/// Default asset request prefix
pub const DEFAULT_ASSET_PREFIX: &str = "/rrs/assetserver";

/// Default registration prefix
pub const DEFAULT_REGISTER_PREFIX: &str = "/rrs/register";

/// A remote cache node reachable over the peer protocol
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PeerServerRecord {
    pub address: String,
    pub port: u16,
    pub path_prefix: String,
}

impl PeerServerRecord {
    pub fn new(address: impl Into<String>, port: u16, path_prefix: impl Into<String>) -> Self {
        let address: String = address.into();
        Self {
            address: unbracket(&address).to_string(),
            port,
            path_prefix: normalize_prefix(&path_prefix.into()),
        }
    }

    /// Parse `addr[:port[/prefix]]`, filling in defaults for missing parts.
    ///
    /// IPv6 addresses take a port only in `[addr]:port` form.
    pub fn parse(spec: &str, default_port: u16, default_prefix: &str) -> Result<Self> {
        let spec = spec.trim();
        let (host_port, prefix) = match spec.find('/') {
            Some(slash) => (&spec[..slash], &spec[slash..]),
            None => (spec, default_prefix),
        };
        let invalid = |what: &str| Error::Config(format!("{} in peer '{}'", what, spec));
        let parse_port = |port: &str| {
            port.parse::<u16>()
                .map_err(|_| invalid(&format!("invalid port '{}'", port)))
        };

        let (address, port) = if let Some(rest) = host_port.strip_prefix('[') {
            let (address, tail) = rest.split_once(']').ok_or_else(|| invalid("unclosed '['"))?;
            match tail {
                "" => (address, default_port),
                _ => match tail.strip_prefix(':') {
                    Some(port) => (address, parse_port(port)?),
                    None => return Err(invalid("unexpected text after ']'")),
                },
            }
        } else {
            match host_port.split_once(':') {
                Some((address, port)) if !port.contains(':') => (address, parse_port(port)?),
                // No port, or a bare IPv6 address
                _ => (host_port, default_port),
            }
        };
        if address.is_empty() {
            return Err(invalid("missing address"));
        }
        Ok(Self::new(address, port, prefix))
    }

    /// Address as it appears in a URL authority
    pub fn host(&self) -> Cow<'_, str> {
        if self.address.contains(':') {
            Cow::Owned(format!("[{}]", self.address))
        } else {
            Cow::Borrowed(&self.address)
        }
    }

    /// URL for fetching one asset from this peer
    pub fn asset_url(&self, id: AssetId, is_texture: bool) -> String {
        format!(
            "http://{}:{}{}?asset={}&texture={}",
            self.host(), self.port, self.path_prefix, id, is_texture
        )
    }

    /// URL announcing `(address, port)` to this peer
    pub fn register_url(&self, register_prefix: &str, address: &str, port: u16) -> String {
        format!(
            "http://{}:{}{}?ip={}&port={}",
            self.host(),
            self.port,
            normalize_prefix(register_prefix),
            urlencoding::encode(address),
            port
        )
    }

    fn same_endpoint(&self, address: &str, port: u16) -> bool {
        self.port == port && self.address.eq_ignore_ascii_case(unbracket(address))
    }
}

impl fmt::Display for PeerServerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.host(), self.port, self.path_prefix)
    }
}

fn unbracket(address: &str) -> &str {
    address
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(address)
}

fn normalize_prefix(prefix: &str) -> String {
    let prefix = prefix.trim();
    if prefix.starts_with('/') {
        prefix.to_string()
    } else {
        format!("/{}", prefix)
    }
}

/// Result of a registration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Added,
    AlreadyKnown,
    /// Registry is at capacity
    Full,
}

struct PeerSlot {
    record: PeerServerRecord,
    failures: AtomicU32,
    registered_at: DateTime<Utc>,
}

/// Bounded peer list
pub struct PeerRegistry {
    peers: RwLock<Vec<Arc<PeerSlot>>>,
    max_peers: usize,
    max_failures: u32,
}

impl PeerRegistry {
    /// `max_failures == 0` disables eviction
    pub fn new(max_peers: usize, max_failures: u32) -> Self {
        Self {
            peers: RwLock::new(Vec::new()),
            max_peers,
            max_failures,
        }
    }

    pub fn register(&self, record: PeerServerRecord) -> RegisterOutcome {
        let mut peers = self.peers.write();
        if peers
            .iter()
            .any(|slot| slot.record.same_endpoint(&record.address, record.port))
        {
            return RegisterOutcome::AlreadyKnown;
        }
        if peers.len() >= self.max_peers {
            return RegisterOutcome::Full;
        }
        peers.push(Arc::new(PeerSlot {
            record,
            failures: AtomicU32::new(0),
            registered_at: Utc::now(),
        }));
        RegisterOutcome::Added
    }

    pub fn contains(&self, address: &str, port: u16) -> bool {
        self.peers
            .read()
            .iter()
            .any(|slot| slot.record.same_endpoint(address, port))
    }

    /// Copy of the current peers in registration order
    pub fn snapshot(&self) -> Vec<PeerServerRecord> {
        self.peers
            .read()
            .iter()
            .map(|slot| slot.record.clone())
            .collect()
    }

    /// Reset the failure count after a well-formed answer
    pub fn record_success(&self, peer: &PeerServerRecord) {
        if let Some(slot) = self.find(peer) {
            slot.failures.store(0, Ordering::Relaxed);
        }
    }

    /// Count a failure; returns `true` when the peer was evicted
    pub fn record_failure(&self, peer: &PeerServerRecord) -> bool {
        let Some(slot) = self.find(peer) else {
            return false;
        };
        let failures = slot.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if self.max_failures == 0 || failures < self.max_failures {
            return false;
        }
        self.remove(&peer.address, peer.port)
    }

    pub fn remove(&self, address: &str, port: u16) -> bool {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|slot| !slot.record.same_endpoint(address, port));
        peers.len() != before
    }

    /// Consecutive failures recorded for a peer
    pub fn failures(&self, peer: &PeerServerRecord) -> Option<u32> {
        self.find(peer)
            .map(|slot| slot.failures.load(Ordering::Relaxed))
    }

    pub fn registered_at(&self, peer: &PeerServerRecord) -> Option<DateTime<Utc>> {
        self.find(peer).map(|slot| slot.registered_at)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    fn find(&self, peer: &PeerServerRecord) -> Option<Arc<PeerSlot>> {
        self.peers
            .read()
            .iter()
            .find(|slot| slot.record.same_endpoint(&peer.address, peer.port))
            .cloned()
    }
}

// =============================================================================
// Tests
// =============================================================================
