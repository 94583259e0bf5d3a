//! Address-only peer exchange.
//!
//! Lighter than [`crate::hostpex`]: the reply carries dialable addresses of
//! mesh peers and nothing else. The requester feeds them into the substrate
//! address book with a TTL, where discovery and the connection manager pick
//! them up. A node only asks while it is under its low watermark.

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use crate::config::speaks_mesh_protocol;
use crate::context::ServiceContext;
use crate::cooldown::RequestGate;
use crate::events::MeshEvent;
use crate::rpc::{self, CallError};
use crate::service::{MeshError, MeshService, TaskSet};
use crate::substrate::PeerStream;
use crate::wire::{write_message, AddressExchangeReply, AddressRecord};

pub const PEX_PROTOCOL: &str = "/tuns/pex/1.0.0";

pub struct PexService {
    ctx: ServiceContext,
    gate: RequestGate,
    tasks: TaskSet,
}

impl PexService {
    pub fn new(ctx: ServiceContext) -> Arc<Self> {
        let gate = RequestGate::new(
            Duration::from_secs(ctx.config.exchange.cooldown_secs),
            ctx.config.exchange.address_workers,
        );
        Arc::new(Self {
            ctx,
            gate,
            tasks: TaskSet::default(),
        })
    }

    /// Connected mesh peers first, then the rest of the address book.
    pub fn build_reply(&self, requester: &PeerId) -> AddressExchangeReply {
        let substrate = &self.ctx.substrate;
        let mut seen: HashSet<PeerId> = HashSet::new();
        seen.insert(self.ctx.local_peer_id());
        seen.insert(*requester);

        let mut peers = Vec::new();
        let ordered = substrate
            .connected_peers()
            .into_iter()
            .chain(substrate.known_peers());
        for peer in ordered {
            if !seen.insert(peer) {
                continue;
            }
            if !speaks_mesh_protocol(&substrate.protocols_of(&peer)) {
                continue;
            }
            let addresses: Vec<String> = substrate
                .addresses_of(&peer)
                .iter()
                .map(Multiaddr::to_string)
                .collect();
            if addresses.is_empty() {
                continue;
            }
            peers.push(AddressRecord {
                peer_id: peer.to_string(),
                addresses,
            });
        }
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(self.ctx.config.exchange.address_cap);
        AddressExchangeReply { peers }
    }

    /// Adds the reply's addresses to the address book; returns how many
    /// peers it covered.
    pub fn merge_reply(&self, reply: AddressExchangeReply) -> usize {
        let me = self.ctx.local_peer_id();
        let ttl = Duration::from_secs(self.ctx.config.exchange.address_ttl_secs);
        let mut merged = 0;
        for record in reply.peers {
            let Ok(peer) = record.peer_id.parse::<PeerId>() else {
                continue;
            };
            if peer == me {
                continue;
            }
            let addrs: Vec<Multiaddr> = record
                .addresses
                .iter()
                .filter_map(|a| a.parse().ok())
                .collect();
            if addrs.is_empty() {
                continue;
            }
            self.ctx.substrate.add_addresses(peer, addrs, ttl);
            merged += 1;
        }
        merged
    }

    pub async fn request_from(&self, peer: PeerId) -> Result<usize, CallError> {
        let timeout = Duration::from_secs(self.ctx.config.exchange.request_timeout_secs);
        let reply: AddressExchangeReply =
            rpc::call::<(), _>(self.ctx.substrate.as_ref(), peer, PEX_PROTOCOL, None, timeout)
                .await?;
        Ok(self.merge_reply(reply))
    }

    fn under_connected(&self) -> bool {
        self.ctx.substrate.connected_peers().len() < self.ctx.config.connections.low_watermark
    }

    pub fn maybe_request(self: &Arc<Self>, peer: PeerId, protocols: &[String]) -> bool {
        if peer == self.ctx.local_peer_id()
            || !protocols.iter().any(|p| p == PEX_PROTOCOL)
            || !self.under_connected()
        {
            return false;
        }
        let Some(permit) = self.gate.admit(peer, Instant::now()) else {
            return false;
        };
        let me = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            match me.request_from(peer).await {
                Ok(n) => log::debug!("pex: {} addresses from {}", n, peer),
                Err(e) => log::debug!("pex: request to {} failed: {}", peer, e),
            }
        });
        true
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
        let cfg = &self.ctx.config.exchange;
        let interval = Duration::from_secs(cfg.sweep_interval_secs);
        let ttl = Duration::from_secs(cfg.ledger_ttl_secs);
        while self.ctx.pause(interval).await {
            self.gate.ledger().prune(Instant::now(), ttl);
            for peer in self.ctx.substrate.connected_peers() {
                let protocols = self.ctx.substrate.protocols_of(&peer);
                self.maybe_request(peer, &protocols);
            }
        }
    }
}

#[async_trait]
impl MeshService for PexService {
    fn name(&self) -> &'static str {
        "pex"
    }

    fn protocol_id(&self) -> Option<&'static str> {
        Some(PEX_PROTOCOL)
    }

    async fn start(self: Arc<Self>) -> Result<(), MeshError> {
        self.tasks.spawn(Arc::clone(&self).watch_events());
        self.tasks.spawn(Arc::clone(&self).sweep_loop());
        Ok(())
    }

    async fn stop(&self) {
        self.tasks.join(Duration::from_secs(5)).await;
    }

    async fn handle_stream(self: Arc<Self>, mut stream: PeerStream) {
        let requester = stream.peer();
        let reply = self.build_reply(&requester);
        if let Err(e) = write_message(&mut stream, &reply).await {
            log::debug!("pex: reply to {} failed: {}", requester, e);
            return;
        }
        let _ = stream.shutdown().await;
    }
}
