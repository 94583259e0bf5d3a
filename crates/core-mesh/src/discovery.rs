//! DHT discovery for the tuns mesh.
//!
//! Discovery runs four jobs over the [`Substrate`](crate::substrate::Substrate) DHT:
//!
//! - **Bootstrap**: dial every configured entry point in parallel, then
//!   bootstrap the DHT. Failure is logged, never fatal.
//! - **Announce**: provide the rendezvous key every 20 minutes, retrying
//!   after a short delay when the provide fails.
//! - **Find**: look up other providers of the rendezvous key every
//!   5 minutes and connect to the ones not already connected.
//! - **Reconnect**: every 30 seconds, redial directory peers that dropped
//!   off, resolving their addresses through the DHT when the address book
//!   has none. A small worker pool bounds concurrent dials.
//!
//! # Example
//!
//! ```no_run
//! use core_mesh::discovery::BootstrapNode;
//!
//! let node = BootstrapNode::parse(
//!     "/ip4/198.51.100.1/tcp/4001/p2p/12D3KooWD3eckifWpRn9wQpMG9R9hX3sD158z7EqHWmweQAJU5SA",
//! );
//! assert!(node.is_some());
//! ```

use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::context::ServiceContext;
use crate::ping;
use crate::service::{MeshError, MeshService, TaskSet};
use crate::substrate::{SubstrateError, TagUpdate};

/// Find rounds that end with nobody connected retry after this instead of
/// waiting out the full interval.
const EMPTY_MESH_RETRY: Duration = Duration::from_secs(5);

/// A trusted entry point into the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapNode {
    pub peer_id: PeerId,
    pub multiaddr: Multiaddr,
}

impl BootstrapNode {
    pub fn new(peer_id: PeerId, multiaddr: Multiaddr) -> Self {
        Self { peer_id, multiaddr }
    }

    /// Parses a multiaddr ending in `/p2p/<peer id>`.
    pub fn parse(addr: &str) -> Option<Self> {
        let multiaddr: Multiaddr = addr.trim().parse().ok()?;
        let peer_id = multiaddr.iter().find_map(|p| match p {
            Protocol::P2p(peer_id) => Some(peer_id),
            _ => None,
        })?;
        Some(Self::new(peer_id, multiaddr))
    }
}

/// Parses the configured entry points, skipping (and logging) bad ones.
pub fn bootstrap_nodes(addrs: &[String]) -> Vec<BootstrapNode> {
    addrs
        .iter()
        .filter_map(|addr| {
            let node = BootstrapNode::parse(addr);
            if node.is_none() {
                log::warn!("discovery: ignoring bootstrap address {:?}", addr);
            }
            node
        })
        .collect()
}

/// DHT key every mesh node provides: SHA-256 of the rendezvous string.
pub fn rendezvous_key(rendezvous: &str) -> Vec<u8> {
    Sha256::digest(rendezvous.as_bytes()).to_vec()
}

pub struct DiscoveryService {
    ctx: ServiceContext,
    key: Vec<u8>,
    tasks: TaskSet,
}

impl DiscoveryService {
    pub fn new(ctx: ServiceContext) -> Arc<Self> {
        let key = rendezvous_key(&ctx.config.discovery.rendezvous);
        Arc::new(Self {
            ctx,
            key,
            tasks: TaskSet::default(),
        })
    }

    fn secs(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    /// Dials every bootstrap node, then bootstraps the DHT. Returns how many
    /// entry points answered.
    pub async fn bootstrap(&self) -> usize {
        let nodes = bootstrap_nodes(&self.ctx.config.bootstrap_peers);
        let timeout = Self::secs(self.ctx.config.discovery.bootstrap_timeout_secs);
        let attempts = nodes.into_iter().map(|node| {
            let substrate = Arc::clone(&self.ctx.substrate);
            async move {
                let dial = substrate.connect(node.peer_id, vec![node.multiaddr.clone()]);
                match tokio::time::timeout(timeout, dial).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        log::debug!("discovery: bootstrap {} failed: {}", node.multiaddr, e);
                        false
                    }
                    Err(_) => {
                        log::debug!("discovery: bootstrap {} timed out", node.multiaddr);
                        false
                    }
                }
            }
        });
        let connected = join_all(attempts).await.into_iter().filter(|ok| *ok).count();
        if connected > 0 {
            log::info!("discovery: connected to {} bootstrap nodes", connected);
        } else {
            log::warn!("discovery: no bootstrap node reachable");
        }

        match tokio::time::timeout(timeout, self.ctx.substrate.bootstrap()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("discovery: DHT bootstrap failed: {}", e),
            Err(_) => log::warn!("discovery: DHT bootstrap timed out"),
        }
        connected
    }

    /// Provides the rendezvous key once.
    pub async fn announce_once(&self) -> Result<(), SubstrateError> {
        let timeout = Self::secs(self.ctx.config.discovery.provide_timeout_secs);
        match tokio::time::timeout(timeout, self.ctx.substrate.provide(self.key.clone())).await {
            Ok(result) => result,
            Err(_) => Err(SubstrateError::Dht("provide timed out".to_string())),
        }
    }

    /// Looks up rendezvous providers and connects to the new ones. Returns
    /// the peers this round connected.
    pub async fn find_once(&self) -> Vec<PeerId> {
        let cfg = &self.ctx.config.discovery;
        let me = self.ctx.local_peer_id();
        let deadline = Instant::now() + Self::secs(cfg.find_timeout_secs);
        let lookup = self.ctx.substrate.find_providers(self.key.clone(), cfg.find_limit);
        let mut providers = match tokio::time::timeout_at(deadline, lookup).await {
            Ok(Ok(rx)) => rx,
            Ok(Err(e)) => {
                log::warn!("discovery: find providers failed: {}", e);
                return Vec::new();
            }
            Err(_) => {
                log::debug!("discovery: find providers timed out");
                return Vec::new();
            }
        };
        // Providers that arrived before the deadline still count.
        let mut found = Vec::new();
        while let Ok(Some(provider)) = tokio::time::timeout_at(deadline, providers.recv()).await {
            found.push(provider);
        }

        let mut connected = Vec::new();
        for provider in found {
            if provider.peer_id == me || provider.addrs.is_empty() {
                continue;
            }
            if self.ctx.substrate.is_connected(&provider.peer_id) {
                continue;
            }
            log::debug!("discovery: found {}", provider.peer_id);
            if self.dial(provider.peer_id, provider.addrs).await {
                connected.push(provider.peer_id);
            }
        }
        connected
    }

    async fn dial(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> bool {
        let timeout = Self::secs(self.ctx.config.discovery.connect_timeout_secs);
        match tokio::time::timeout(timeout, self.ctx.substrate.connect(peer, addrs)).await {
            Ok(Ok(())) => {
                self.mark_connected(peer);
                true
            }
            Ok(Err(e)) => {
                log::debug!("discovery: connect to {} failed: {}", peer, e);
                false
            }
            Err(_) => {
                log::debug!("discovery: connect to {} timed out", peer);
                false
            }
        }
    }

    fn mark_connected(&self, peer: PeerId) {
        let now = Instant::now();
        if self.ctx.directory.observe_connected(peer, now) {
            log::info!("discovery: connected to new peer {}", peer);
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = ping::ping_peer(&ctx, peer).await {
                    log::debug!("discovery: handshake with {} failed: {}", peer, e);
                }
            });
        }
        self.ctx
            .adjust_quality(&peer, TagUpdate::Seed(self.ctx.config.quality.seed_connect));
    }

    /// Redials directory peers that are not connected. Returns how many came
    /// back.
    pub async fn reconnect_once(&self) -> usize {
        let cfg = &self.ctx.config.discovery;
        let me = self.ctx.local_peer_id();
        let missing: Vec<PeerId> = self
            .ctx
            .directory
            .disconnected_peers(&self.ctx.connected_set())
            .into_iter()
            .filter(|p| *p != me)
            .collect();
        if missing.is_empty() {
            return 0;
        }
        log::debug!("discovery: reconnecting {} peers", missing.len());

        let results: Vec<bool> = stream::iter(missing)
            .map(|peer| self.reconnect(peer))
            .buffer_unordered(cfg.reconnect_workers.max(1))
            .collect()
            .await;
        results.into_iter().filter(|ok| *ok).count()
    }

    async fn reconnect(&self, peer: PeerId) -> bool {
        if self.ctx.shutdown.is_cancelled() {
            return false;
        }
        let mut addrs = self.ctx.substrate.addresses_of(&peer);
        if addrs.is_empty() {
            let timeout = Self::secs(self.ctx.config.discovery.find_peer_timeout_secs);
            addrs = match tokio::time::timeout(timeout, self.ctx.substrate.find_peer(peer)).await {
                Ok(Ok(found)) if !found.is_empty() => found,
                _ => return false,
            };
        }
        // a successful dial refreshes last_seen
        self.dial(peer, addrs).await
    }

    async fn run(self: Arc<Self>) {
        self.bootstrap().await;
        tokio::join!(self.announce_loop(), self.find_loop(), self.reconnect_loop());
    }

    async fn announce_loop(&self) {
        let cfg = &self.ctx.config.discovery;
        loop {
            let wait = match self.announce_once().await {
                Ok(()) => {
                    log::debug!("discovery: provided rendezvous key");
                    Self::secs(cfg.provide_interval_secs)
                }
                Err(e) => {
                    log::warn!("discovery: provide failed: {}", e);
                    Self::secs(cfg.provide_retry_secs)
                }
            };
            if !self.ctx.pause(wait).await {
                break;
            }
        }
    }

    async fn find_loop(&self) {
        let interval = Self::secs(self.ctx.config.discovery.find_interval_secs);
        loop {
            self.find_once().await;
            let wait = if self.ctx.substrate.connected_peers().is_empty() {
                EMPTY_MESH_RETRY
            } else {
                interval
            };
            if !self.ctx.pause(wait).await {
                break;
            }
        }
    }

    async fn reconnect_loop(&self) {
        let interval = Self::secs(self.ctx.config.discovery.reconnect_interval_secs);
        while self.ctx.pause(interval).await {
            let back = self.reconnect_once().await;
            if back > 0 {
                log::info!("discovery: reconnected {} peers", back);
            }
        }
    }
}

#[async_trait]
impl MeshService for DiscoveryService {
    fn name(&self) -> &'static str {
        "discovery"
    }

    async fn start(self: Arc<Self>) -> Result<(), MeshError> {
        let me = Arc::clone(&self);
        self.tasks.spawn(me.run());
        Ok(())
    }

    async fn stop(&self) {
        self.tasks.join(Duration::from_secs(5)).await;
    }
}
