//! Node Configuration
//!
//! Settings for one cache node, assembled from CLI flags and an optional
//! static peer file.
//!
//! # Peer File
//!
//! ```text
//! # comment
//! localport=9999
//! prefix=/rrs/assetserver
//! register=/rrs/register
//! server=10.0.0.2
//! server=grid.example:8002/assets
//! ```
//!
//! `localport` and `prefix` also become the defaults for `server` lines that
//! follow them.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::cache::{EngineConfig, DEFAULT_ENTRY_TTL};
use crate::error::{Error, Result};
use crate::peer::{
    PeerServerRecord, ResolverConfig, DEFAULT_ASSET_PREFIX, DEFAULT_PEER_PORT,
    DEFAULT_REGISTER_PREFIX,
};

/// Configuration for a cache node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Peer endpoint listener port
    pub listen_port: u16,
    /// Path serving asset fetches
    pub asset_prefix: String,
    /// Path accepting peer registrations
    pub register_prefix: String,
    /// Statically configured peers, in file order
    pub peers: Vec<PeerServerRecord>,
    pub engine: EngineConfig,
    pub peer_timeout: Duration,
    pub max_peers: usize,
    /// Consecutive failures before a peer is dropped (0 disables)
    pub max_peer_failures: u32,
    /// Address announced to peers at startup
    pub advertise_address: Option<String>,
    /// Log request and response details
    pub dump_packets: bool,
    /// Serve the payload-only response form
    pub legacy_wire: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PEER_PORT,
            asset_prefix: DEFAULT_ASSET_PREFIX.to_string(),
            register_prefix: DEFAULT_REGISTER_PREFIX.to_string(),
            peers: Vec::new(),
            engine: EngineConfig {
                entry_ttl: DEFAULT_ENTRY_TTL,
                ..EngineConfig::default()
            },
            peer_timeout: Duration::from_secs(10),
            max_peers: 64,
            max_peer_failures: 5,
            advertise_address: None,
            dump_packets: false,
            legacy_wire: false,
        }
    }
}

impl NodeConfig {
    /// Read and apply a peer file
    pub fn load_peer_file(&mut self, path: &Path, local_addrs: &[String]) -> Result<()> {
        let contents = std::fs::read_to_string(path)?;
        info!(path = %path.display(), "Loading peer file");
        self.apply_peer_file(&contents, local_addrs)
    }

    /// Apply peer file directives.
    ///
    /// Lines naming one of `local_addrs` are skipped, as are `server`
    /// entries pointing at one of them.
    pub fn apply_peer_file(&mut self, contents: &str, local_addrs: &[String]) -> Result<()> {
        for raw in contents.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if is_local(line, local_addrs) {
                debug!(line, "Ignoring local host");
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                debug!(line, "Ignoring unrecognized peer file line");
                continue;
            };
            let value = value.trim();

            match key.trim().to_ascii_lowercase().as_str() {
                "localport" => {
                    self.listen_port = value.parse().map_err(|_| {
                        Error::Config(format!("invalid localport '{}'", value))
                    })?;
                }
                "prefix" => self.asset_prefix = normalize_path(value),
                "register" => self.register_prefix = normalize_path(value),
                "server" => {
                    let peer = PeerServerRecord::parse(value, self.listen_port, &self.asset_prefix)?;
                    if is_local(&peer.address, local_addrs) {
                        debug!(%peer, "Ignoring local host");
                        continue;
                    }
                    self.add_peer(peer);
                }
                other => debug!(key = other, value, "Unrecognized peer file directive"),
            }
        }
        Ok(())
    }

    /// Parse and add an `addr[:port[/prefix]]` peer
    pub fn add_peer_spec(&mut self, spec: &str) -> Result<()> {
        let peer = PeerServerRecord::parse(spec, self.listen_port, &self.asset_prefix)?;
        self.add_peer(peer);
        Ok(())
    }

    fn add_peer(&mut self, peer: PeerServerRecord) {
        if !self.peers.contains(&peer) {
            self.peers.push(peer);
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            peer_timeout: self.peer_timeout,
            default_port: self.listen_port,
            asset_prefix: self.asset_prefix.clone(),
            register_prefix: self.register_prefix.clone(),
            max_peers: self.max_peers,
            max_peer_failures: self.max_peer_failures,
            local_addresses: self.local_addresses(),
        }
    }

    /// Names this node answers to; peers naming one of them are ignored
    pub fn local_addresses(&self) -> Vec<String> {
        let mut local = vec!["127.0.0.1".to_string(), "localhost".to_string()];
        local.extend(self.advertise_address.iter().cloned());
        local
    }
}

fn is_local(value: &str, local_addrs: &[String]) -> bool {
    local_addrs.iter().any(|addr| addr.eq_ignore_ascii_case(value))
}

fn normalize_path(value: &str) -> String {
    if value.starts_with('/') {
        value.to_string()
    } else {
        format!("/{}", value)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.listen_port, 9999);
        assert_eq!(config.asset_prefix, "/rrs/assetserver");
        assert_eq!(config.register_prefix, "/rrs/register");
        assert_eq!(config.engine.entry_ttl, Duration::from_secs(86400));
        assert_eq!(config.engine.sync_timeout, Duration::from_millis(3000));
    }

    #[test]
    fn test_resolver_config_knows_local_addresses() {
        let config = NodeConfig {
            advertise_address: Some("10.1.1.1".into()),
            ..NodeConfig::default()
        };
        let resolver = config.resolver_config();
        assert_eq!(resolver.local_addresses, vec!["127.0.0.1", "localhost", "10.1.1.1"]);
        assert_eq!(resolver.default_port, config.listen_port);
    }

    #[test]
    fn test_peer_file() {
        let mut config = NodeConfig::default();
        let file = "\
            # grid peers\n\
            localport=8100\n\
            prefix=assets\n\
            register=/reg\n\
            \n\
            server=10.0.0.2\n\
            server=10.0.0.3:8200\n\
            server=10.0.0.4:8300/other/path\n\
            colour=blue\n";

        config.apply_peer_file(file, &[]).unwrap();

        assert_eq!(config.listen_port, 8100);
        assert_eq!(config.asset_prefix, "/assets");
        assert_eq!(config.register_prefix, "/reg");
        assert_eq!(
            config.peers,
            vec![
                PeerServerRecord::new("10.0.0.2", 8100, "/assets"),
                PeerServerRecord::new("10.0.0.3", 8200, "/assets"),
                PeerServerRecord::new("10.0.0.4", 8300, "/other/path"),
            ]
        );
    }

    #[test]
    fn test_local_lines_ignored() {
        let mut config = NodeConfig::default();
        let locals = vec!["192.168.1.10".to_string()];
        config
            .apply_peer_file("192.168.1.10\nserver=192.168.1.10\nserver=192.168.1.11\n", &locals)
            .unwrap();
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].address, "192.168.1.11");
    }

    #[test]
    fn test_invalid_port_is_config_error() {
        let mut config = NodeConfig::default();
        assert_matches!(
            config.apply_peer_file("localport=abc\n", &[]),
            Err(Error::Config(_))
        );
        assert_matches!(
            config.apply_peer_file("server=10.0.0.2:99999\n", &[]),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_duplicate_peers_collapsed() {
        let mut config = NodeConfig::default();
        config.add_peer_spec("10.0.0.2").unwrap();
        config.add_peer_spec("10.0.0.2:9999").unwrap();
        assert_eq!(config.peers.len(), 1);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let mut config = NodeConfig::default();
        let result = config.load_peer_file(Path::new("/nonexistent/interop.txt"), &[]);
        assert_matches!(result, Err(Error::Io(_)));
    }
}
