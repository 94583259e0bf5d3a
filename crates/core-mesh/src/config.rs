//! Node configuration.
//!
//! Every interval, timeout, capacity and scoring magnitude used by the mesh
//! services lives here. Defaults match the values the network was tuned
//! with; the binary overlays a YAML file and environment variables on top.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::directory::StalenessWindows;

/// Prefix shared by every protocol identifier this node speaks.
pub const PROTOCOL_FAMILY: &str = "/tuns/";

/// Name of the connection-quality tag kept in the substrate tag store.
pub const QUALITY_TAG: &str = "tuns-node";

/// Returns true when any advertised protocol belongs to the mesh family.
pub fn speaks_mesh_protocol<S: AsRef<str>>(protocols: &[S]) -> bool {
    protocols
        .iter()
        .any(|p| p.as_ref().starts_with(PROTOCOL_FAMILY))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Host patterns this node serves itself and announces to the mesh.
    pub hosts: Vec<String>,
    /// Multiaddrs to listen on.
    pub listen_addrs: Vec<String>,
    /// Entry points, as multiaddrs ending in `/p2p/<peer id>`.
    pub bootstrap_peers: Vec<String>,
    /// Version string carried in ping replies and identify.
    pub version: String,
    pub admission: AdmissionConfig,
    pub connections: ConnectionConfig,
    pub discovery: DiscoveryConfig,
    pub gossip: GossipConfig,
    pub exchange: ExchangeConfig,
    pub quality: QualityConfig,
    pub router: RouterConfig,
    pub tunnel: TunnelConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["*themoviedb.org".to_string(), "*tmdb.org".to_string()],
            listen_addrs: vec![
                "/ip4/0.0.0.0/tcp/0".to_string(),
                "/ip6/::/tcp/0".to_string(),
            ],
            bootstrap_peers: Vec::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            admission: AdmissionConfig::default(),
            connections: ConnectionConfig::default(),
            discovery: DiscoveryConfig::default(),
            gossip: GossipConfig::default(),
            exchange: ExchangeConfig::default(),
            quality: QualityConfig::default(),
            router: RouterConfig::default(),
            tunnel: TunnelConfig::default(),
        }
    }
}

impl MeshConfig {
    pub fn staleness(&self) -> StalenessWindows {
        StalenessWindows {
            gossip: Duration::from_secs(self.gossip.stale_after_secs),
            exchange: Duration::from_secs(self.exchange.stale_after_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Concurrent inbound proxy/tunnel requests.
    pub slots: usize,
    /// How long a slot stays occupied after its request closes.
    pub cooldown_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            slots: 5,
            cooldown_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub low_watermark: usize,
    pub high_watermark: usize,
    /// New connections are exempt from trimming for this long.
    pub grace_secs: u64,
    pub trim_interval_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            low_watermark: 20,
            high_watermark: 50,
            grace_secs: 60,
            trim_interval_secs: 30,
            idle_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Hashed into the DHT key every node provides and searches for.
    pub rendezvous: String,
    pub bootstrap_timeout_secs: u64,
    pub provide_interval_secs: u64,
    pub provide_timeout_secs: u64,
    pub provide_retry_secs: u64,
    pub find_interval_secs: u64,
    pub find_timeout_secs: u64,
    pub find_limit: usize,
    pub reconnect_interval_secs: u64,
    pub reconnect_workers: usize,
    pub connect_timeout_secs: u64,
    pub find_peer_timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            rendezvous: "tuns-discovery-0001".to_string(),
            bootstrap_timeout_secs: 5,
            provide_interval_secs: 20 * 60,
            provide_timeout_secs: 30,
            provide_retry_secs: 20,
            find_interval_secs: 5 * 60,
            find_timeout_secs: 20,
            find_limit: 20,
            reconnect_interval_secs: 30,
            reconnect_workers: 5,
            connect_timeout_secs: 15,
            find_peer_timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub topic: String,
    pub announce_interval_secs: u64,
    pub gc_interval_secs: u64,
    /// Staleness window for records last sighted by gossip or connect.
    pub stale_after_secs: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            topic: format!("tuns-announce-{}", env!("CARGO_PKG_VERSION_MAJOR")),
            announce_interval_secs: 60,
            gc_interval_secs: 60,
            stale_after_secs: 5 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Minimum spacing between two requests to the same peer.
    pub cooldown_secs: u64,
    pub request_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub gc_interval_secs: u64,
    /// Cooldown bookkeeping older than this is dropped.
    pub ledger_ttl_secs: u64,
    pub capability_cap: usize,
    pub capability_workers: usize,
    pub address_cap: usize,
    pub address_workers: usize,
    pub address_ttl_secs: u64,
    pub max_directory: usize,
    pub evict_batch: usize,
    /// Staleness window for records learned through capability exchange.
    pub stale_after_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 5 * 60,
            request_timeout_secs: 10,
            sweep_interval_secs: 10 * 60,
            gc_interval_secs: 5 * 60,
            ledger_ttl_secs: 60 * 60,
            capability_cap: 100,
            capability_workers: 10,
            address_cap: 30,
            address_workers: 5,
            address_ttl_secs: 60 * 60,
            max_directory: 500,
            evict_batch: 10,
            stale_after_secs: 30 * 60,
        }
    }
}

/// Quality-tag magnitudes. Tags live in `[0, 100]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub reward: i32,
    pub failure_penalty: i32,
    pub busy_penalty: i32,
    /// Tag given to a peer on its first gossip or exchange sighting.
    pub seed_sighting: i32,
    /// Tag given to a peer discovery managed to connect.
    pub seed_connect: i32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            reward: 10,
            failure_penalty: 20,
            busy_penalty: 10,
            seed_sighting: 60,
            seed_connect: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub dial_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: 15,
            handshake_timeout_secs: 10,
            idle_timeout_secs: 5 * 60,
        }
    }
}
