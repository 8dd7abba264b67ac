//! GridCache Node
//!
//! Runs one asset cache node: the engine with its worker pools, the peer
//! endpoint and the admin listener.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        GridCache Node                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    Asset     │───▶│    Asset     │───▶│    Peer      │       │
//! │  │   Endpoint   │    │ Cache Engine │    │   Resolver   │       │
//! │  │   (:9999)    │    │              │    │              │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │                      Admin (:9998)                              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gridcache::cache::{AssetCacheEngine, InMemoryAssetStore, LoggingTransport};
use gridcache::config::NodeConfig;
use gridcache::error::{Error, Result};
use gridcache::peer::{HttpPeerClient, PeerAssetResolver};
use gridcache::server::{self, AdminEndpoint, AssetEndpoint, HealthCheck};

// =============================================================================
// CLI Arguments
// =============================================================================

/// GridCache - distributed asset cache node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Peer endpoint listener port
    #[arg(long, env = "GRIDCACHE_PORT", default_value = "9999")]
    port: u16,

    /// Path serving asset fetches
    #[arg(long, env = "GRIDCACHE_ASSET_PREFIX", default_value = "/rrs/assetserver")]
    asset_prefix: String,

    /// Path accepting peer registrations
    #[arg(long, env = "GRIDCACHE_REGISTER_PREFIX", default_value = "/rrs/register")]
    register_prefix: String,

    /// Static peer file
    #[arg(long, env = "GRIDCACHE_PEER_FILE")]
    peer_file: Option<PathBuf>,

    /// Additional peer as addr[:port[/prefix]] (repeatable)
    #[arg(long = "peer", value_name = "PEER")]
    peers: Vec<String>,

    /// Delivery queue workers
    #[arg(long, env = "GRIDCACHE_DELIVERY_WORKERS", default_value = "1")]
    delivery_workers: usize,

    /// Deferred-region queue workers
    #[arg(long, env = "GRIDCACHE_REGION_WORKERS", default_value = "1")]
    region_workers: usize,

    /// Deferred-client queue workers
    #[arg(long, env = "GRIDCACHE_CLIENT_WORKERS", default_value = "1")]
    client_workers: usize,

    /// Memory tier entry lifetime in seconds
    #[arg(long, env = "GRIDCACHE_ENTRY_TTL_SECS", default_value = "86400")]
    entry_ttl_secs: u64,

    /// Per-peer request timeout in seconds
    #[arg(long, env = "GRIDCACHE_PEER_TIMEOUT_SECS", default_value = "10")]
    peer_timeout_secs: u64,

    /// Bound for synchronous lookups in milliseconds
    #[arg(long, env = "GRIDCACHE_SYNC_TIMEOUT_MS", default_value = "3000")]
    sync_timeout_ms: u64,

    /// Maximum registered peers
    #[arg(long, env = "GRIDCACHE_MAX_PEERS", default_value = "64")]
    max_peers: usize,

    /// Consecutive failures before a peer is dropped (0 disables)
    #[arg(long, env = "GRIDCACHE_MAX_PEER_FAILURES", default_value = "5")]
    max_peer_failures: u32,

    /// Address announced to peers at startup
    #[arg(long, env = "GRIDCACHE_ADVERTISE_ADDRESS")]
    advertise_address: Option<String>,

    /// Admin server bind address
    #[arg(long, env = "GRIDCACHE_ADMIN_ADDR", default_value = "0.0.0.0:9998")]
    admin_addr: String,

    /// Interval between expired-entry sweeps in seconds (0 disables)
    #[arg(long, env = "GRIDCACHE_PURGE_INTERVAL_SECS", default_value = "300")]
    purge_interval_secs: u64,

    /// Log request parameters, headers and peer responses
    #[arg(long, env = "GRIDCACHE_DUMP_PACKETS")]
    dump_packets: bool,

    /// Serve the payload-only response form
    #[arg(long, env = "GRIDCACHE_LEGACY_WIRE")]
    legacy_wire: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = NodeConfig {
            listen_port: self.port,
            asset_prefix: self.asset_prefix.clone(),
            register_prefix: self.register_prefix.clone(),
            peer_timeout: Duration::from_secs(self.peer_timeout_secs),
            max_peers: self.max_peers,
            max_peer_failures: self.max_peer_failures,
            advertise_address: self.advertise_address.clone(),
            dump_packets: self.dump_packets,
            legacy_wire: self.legacy_wire,
            ..NodeConfig::default()
        };
        config.engine.entry_ttl = Duration::from_secs(self.entry_ttl_secs);
        config.engine.sync_timeout = Duration::from_millis(self.sync_timeout_ms);
        config.engine.delivery_workers = self.delivery_workers;
        config.engine.region_workers = self.region_workers;
        config.engine.client_workers = self.client_workers;

        if let Some(path) = &self.peer_file {
            let local = config.local_addresses();
            config.load_peer_file(path, &local)?;
        }
        for peer in &self.peers {
            config.add_peer_spec(peer)?;
        }
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = args.node_config()?;

    info!("Starting GridCache node");
    info!("  Peer endpoint port: {}", config.listen_port);
    info!("  Asset prefix: {}", config.asset_prefix);
    info!("  Register prefix: {}", config.register_prefix);
    info!("  Static peers: {}", config.peers.len());
    info!(
        "  Workers: delivery={} region={} client={}",
        config.engine.delivery_workers, config.engine.region_workers, config.engine.client_workers
    );
    info!("  Entry TTL: {:?}", config.engine.entry_ttl);

    // Collaborators
    let backend = Arc::new(InMemoryAssetStore::new());
    let client = Arc::new(HttpPeerClient::new(config.peer_timeout)?.with_dump(config.dump_packets));
    let resolver = Arc::new(PeerAssetResolver::new(client, config.resolver_config()));
    for peer in &config.peers {
        resolver.register_record(peer.clone());
    }
    let transport = Arc::new(LoggingTransport::info_level());

    let engine = AssetCacheEngine::new(config.engine.clone(), backend, resolver, transport);
    engine.start();

    let shutdown = CancellationToken::new();
    let health = Arc::new(HealthCheck::new());

    // Peer endpoint
    let endpoint = Arc::new(
        AssetEndpoint::new(
            Arc::clone(&engine),
            config.asset_prefix.clone(),
            config.register_prefix.clone(),
        )
        .with_legacy_wire(config.legacy_wire)
        .with_dump(config.dump_packets),
    );
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.listen_port))).await?;
    let endpoint_task = tokio::spawn(server::serve(listener, endpoint, shutdown.clone()));

    // Admin server
    let admin_addr: SocketAddr = args
        .admin_addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid admin address '{}': {}", args.admin_addr, e)))?;
    let admin = Arc::new(AdminEndpoint::new(Arc::clone(&engine), Arc::clone(&health))?);
    let admin_listener = TcpListener::bind(admin_addr).await?;
    let admin_task = tokio::spawn(server::serve(admin_listener, admin, shutdown.clone()));

    // Expired-entry sweeps
    if args.purge_interval_secs > 0 {
        let engine = Arc::clone(&engine);
        let shutdown = shutdown.clone();
        let period = Duration::from_secs(args.purge_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        engine.purge_expired();
                    }
                }
            }
        });
    }

    if let Some(address) = &config.advertise_address {
        let accepted = engine.resolver().announce(address, config.listen_port).await;
        info!(
            "Announced {}:{} to {}/{} peers",
            address,
            config.listen_port,
            accepted,
            engine.resolver().peer_count()
        );
    }

    health.set_ready(true);
    info!("GridCache node ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutting down");
    health.set_ready(false);
    shutdown.cancel();
    engine.shutdown().await;

    for (name, task) in [("peer endpoint", endpoint_task), ("admin server", admin_task)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} error: {}", name, e),
            Err(e) => warn!("{} task failed: {}", name, e),
        }
    }

    info!("GridCache node stopped");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
