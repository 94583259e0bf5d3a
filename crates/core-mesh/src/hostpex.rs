//! Capability exchange.
//!
//! A node asks a connected peer for the host-serving peers it knows about
//! and folds the answer into its own directory. This is the canonical way
//! capability data moves between nodes besides gossip; the address-only
//! variant in [`crate::pex`] never touches the directory.
//!
//! Requests go out when identification shows a peer speaks this protocol and
//! on a slow sweep over every connected peer. Both paths pass a per-peer
//! cooldown and a small worker limit.

use async_trait::async_trait;
use libp2p::PeerId;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use crate::context::ServiceContext;
use crate::cooldown::RequestGate;
use crate::directory::ExchangedRecord;
use crate::events::MeshEvent;
use crate::rpc::{self, CallError};
use crate::service::{MeshError, MeshService, TaskSet};
use crate::substrate::{PeerStream, TagUpdate};
use crate::wire::{unix_now, write_message, CapabilityExchangeReply, ExchangedPeer};

pub const HOSTPEX_PROTOCOL: &str = "/tuns/hostpex/1.0.0";

pub struct HostPexService {
    ctx: ServiceContext,
    gate: RequestGate,
    tasks: TaskSet,
}

impl HostPexService {
    pub fn new(ctx: ServiceContext) -> Arc<Self> {
        let gate = RequestGate::new(
            Duration::from_secs(ctx.config.exchange.cooldown_secs),
            ctx.config.exchange.capability_workers,
        );
        Arc::new(Self {
            ctx,
            gate,
            tasks: TaskSet::default(),
        })
    }

    /// What this node tells `requester`: itself when it serves anything,
    /// then every directory peer with hosts, shuffled and capped.
    pub fn build_reply(&self, requester: &PeerId) -> CapabilityExchangeReply {
        let now_unix = unix_now();
        let mut peers: Vec<ExchangedPeer> = Vec::new();
        if !self.ctx.config.hosts.is_empty() {
            peers.push(ExchangedPeer {
                peer_id: self.ctx.local_peer_id().to_string(),
                hosts: self.ctx.config.hosts.clone(),
                timestamp: now_unix,
                last_seen: now_unix,
            });
        }
        for record in self.ctx.directory.snapshot() {
            if record.peer_id == *requester || record.hosts.is_empty() {
                continue;
            }
            let age = record.last_seen.elapsed().as_secs() as i64;
            peers.push(ExchangedPeer {
                peer_id: record.peer_id.to_string(),
                hosts: record.hosts,
                timestamp: record.timestamp,
                last_seen: now_unix - age,
            });
        }
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(self.ctx.config.exchange.capability_cap);
        CapabilityExchangeReply { peers }
    }

    /// Folds a reply into the directory; returns the peers it introduced.
    pub fn merge_reply(&self, reply: CapabilityExchangeReply, now: Instant) -> Vec<PeerId> {
        let me = self.ctx.local_peer_id();
        let batch: Vec<ExchangedRecord> = reply
            .peers
            .into_iter()
            .filter_map(|entry| {
                let peer_id: PeerId = entry.peer_id.parse().ok()?;
                (peer_id != me && !entry.hosts.is_empty()).then_some(ExchangedRecord {
                    peer_id,
                    hosts: entry.hosts,
                    timestamp: entry.timestamp,
                })
            })
            .collect();
        let cfg = &self.ctx.config.exchange;
        let inserted =
            self.ctx
                .directory
                .merge_exchanged(batch, cfg.max_directory, cfg.evict_batch, now);
        for peer in &inserted {
            self.ctx
                .adjust_quality(peer, TagUpdate::Seed(self.ctx.config.quality.seed_sighting));
        }
        inserted
    }

    /// Asks `peer` once, ignoring the cooldown.
    pub async fn request_from(&self, peer: PeerId) -> Result<Vec<PeerId>, CallError> {
        let timeout = Duration::from_secs(self.ctx.config.exchange.request_timeout_secs);
        let reply: CapabilityExchangeReply = rpc::call::<(), _>(
            self.ctx.substrate.as_ref(),
            peer,
            HOSTPEX_PROTOCOL,
            None,
            timeout,
        )
        .await?;
        log::debug!("hostpex: {} sent {} peers", peer, reply.peers.len());
        Ok(self.merge_reply(reply, Instant::now()))
    }

    fn supports(&self, peer: &PeerId, protocols: &[String]) -> bool {
        *peer != self.ctx.local_peer_id() && protocols.iter().any(|p| p == HOSTPEX_PROTOCOL)
    }

    /// Starts a request to `peer` in the background if the gate lets it
    /// through. Returns whether one was started.
    pub fn maybe_request(self: &Arc<Self>, peer: PeerId, protocols: &[String]) -> bool {
        if !self.supports(&peer, protocols) {
            return false;
        }
        let Some(permit) = self.gate.admit(peer, Instant::now()) else {
            return false;
        };
        let me = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            match me.request_from(peer).await {
                Ok(new_peers) if !new_peers.is_empty() => {
                    log::info!("hostpex: learned {} peers from {}", new_peers.len(), peer)
                }
                Ok(_) => {}
                Err(e) => log::debug!("hostpex: request to {} failed: {}", peer, e),
            }
        });
        true
    }

    /// Offers every connected peer a request. Returns how many started.
    pub fn sweep(self: &Arc<Self>) -> usize {
        self.ctx
            .substrate
            .connected_peers()
            .into_iter()
            .filter(|peer| {
                let protocols = self.ctx.substrate.protocols_of(peer);
                self.maybe_request(*peer, &protocols)
            })
            .count()
    }

    async fn watch_events(self: Arc<Self>) {
        let mut events = self.ctx.substrate.subscribe_events();
        loop {
            let event = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                next = events.next() => match next {
                    Some(e) => e,
                    None => break,
                },
            };
            if let MeshEvent::PeerIdentified { peer, protocols } = event {
                self.maybe_request(peer, &protocols);
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.ctx.config.exchange.sweep_interval_secs);
        while self.ctx.pause(interval).await {
            let started = self.sweep();
            log::debug!("hostpex: sweep started {} requests", started);
        }
    }

    async fn gc_loop(self: Arc<Self>) {
        let cfg = &self.ctx.config.exchange;
        let interval = Duration::from_secs(cfg.gc_interval_secs);
        let ttl = Duration::from_secs(cfg.ledger_ttl_secs);
        while self.ctx.pause(interval).await {
            self.gate.ledger().prune(Instant::now(), ttl);
        }
    }
}

#[async_trait]
impl MeshService for HostPexService {
    fn name(&self) -> &'static str {
        "hostpex"
    }

    fn protocol_id(&self) -> Option<&'static str> {
        Some(HOSTPEX_PROTOCOL)
    }

    async fn start(self: Arc<Self>) -> Result<(), MeshError> {
        self.tasks.spawn(Arc::clone(&self).watch_events());
        self.tasks.spawn(Arc::clone(&self).sweep_loop());
        self.tasks.spawn(Arc::clone(&self).gc_loop());
        Ok(())
    }

    async fn stop(&self) {
        self.tasks.join(Duration::from_secs(5)).await;
    }

    async fn handle_stream(self: Arc<Self>, mut stream: PeerStream) {
        let requester = stream.peer();
        let reply = self.build_reply(&requester);
        log::debug!("hostpex: sending {} peers to {}", reply.peers.len(), requester);
        if let Err(e) = write_message(&mut stream, &reply).await {
            log::debug!("hostpex: reply to {} failed: {}", requester, e);
            return;
        }
        let _ = stream.shutdown().await;
    }
}
