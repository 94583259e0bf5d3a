//! Host-capability gossip.
//!
//! Every node that serves at least one host pattern publishes a
//! [`PeerAnnouncement`] on the announce topic once a minute. Every node
//! listens on the same topic and folds what it hears into the
//! [`PeerDirectory`](crate::directory::PeerDirectory), last writer wins.
//! A GC loop drops records that are disconnected and no longer sighted.

use async_trait::async_trait;
use libp2p::PeerId;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::context::ServiceContext;
use crate::directory::{MergeOutcome, RecordSource};
use crate::service::{MeshError, MeshService, TaskSet};
use crate::substrate::{TagUpdate, TopicMessage, TopicSubscription};
use crate::wire::{unix_now, PeerAnnouncement};

pub struct GossipService {
    ctx: ServiceContext,
    tasks: TaskSet,
}

impl GossipService {
    pub fn new(ctx: ServiceContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            tasks: TaskSet::default(),
        })
    }

    /// This node's announcement; `None` when it serves nothing.
    pub fn announcement(&self) -> Option<PeerAnnouncement> {
        if self.ctx.config.hosts.is_empty() {
            return None;
        }
        Some(PeerAnnouncement {
            peer_id: self.ctx.local_peer_id().to_string(),
            hosts: self.ctx.config.hosts.clone(),
            timestamp: unix_now(),
        })
    }

    /// Publishes one announcement. Returns false when there was nothing to say.
    pub async fn announce_once(&self) -> Result<bool, MeshError> {
        let Some(announcement) = self.announcement() else {
            return Ok(false);
        };
        let data = announcement.to_bytes()?;
        self.ctx
            .substrate
            .publish(&self.ctx.config.gossip.topic, data)
            .await?;
        log::debug!("gossip: announced {} host patterns", announcement.hosts.len());
        Ok(true)
    }

    /// Merges one topic message into the directory.
    ///
    /// Messages that fail to decode, claim another author than the one that
    /// signed them, or come from this node are dropped.
    pub fn handle_message(&self, message: &TopicMessage, now: Instant) -> Option<MergeOutcome> {
        let announcement = match PeerAnnouncement::from_bytes(&message.data) {
            Ok(a) => a,
            Err(e) => {
                log::debug!("gossip: dropping undecodable announcement: {}", e);
                return None;
            }
        };
        let peer: PeerId = match announcement.peer_id.parse() {
            Ok(p) => p,
            Err(_) => {
                log::debug!("gossip: bad peer id {:?}", announcement.peer_id);
                return None;
            }
        };
        if let Some(source) = message.source {
            if source != peer {
                log::warn!("gossip: {} announced on behalf of {}, dropped", source, peer);
                return None;
            }
        }
        if peer == self.ctx.local_peer_id() {
            return None;
        }

        let outcome = self.ctx.directory.merge(
            peer,
            announcement.hosts,
            announcement.timestamp,
            RecordSource::Gossip,
            now,
        );
        if outcome == MergeOutcome::Inserted {
            self.ctx
                .adjust_quality(&peer, TagUpdate::Seed(self.ctx.config.quality.seed_sighting));
            log::info!("gossip: new peer {}", peer);
        }
        Some(outcome)
    }

    /// Removes stale, disconnected records along with their tags.
    pub fn collect_garbage(&self, now: Instant) -> Vec<PeerId> {
        let connected = self.ctx.connected_set();
        let removed =
            self.ctx
                .directory
                .collect_garbage(now, &connected, self.ctx.config.staleness());
        for peer in &removed {
            self.ctx.substrate.clear_tags(peer);
        }
        if !removed.is_empty() {
            log::info!("gossip: removed {} stale peers", removed.len());
        }
        removed
    }

    async fn listen(self: Arc<Self>, mut subscription: TopicSubscription) {
        loop {
            let message = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                next = subscription.next() => match next {
                    Some(m) => m,
                    None => {
                        log::warn!("gossip: subscription to {} closed", subscription.topic());
                        break;
                    }
                },
            };
            self.handle_message(&message, Instant::now());
        }
    }

    async fn announce_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.ctx.config.gossip.announce_interval_secs);
        loop {
            if let Err(e) = self.announce_once().await {
                log::warn!("gossip: announce failed: {}", e);
            }
            if !self.ctx.pause(interval).await {
                break;
            }
        }
    }

    async fn gc_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.ctx.config.gossip.gc_interval_secs);
        while self.ctx.pause(interval).await {
            self.collect_garbage(Instant::now());
        }
    }
}

#[async_trait]
impl MeshService for GossipService {
    fn name(&self) -> &'static str {
        "gossip"
    }

    async fn start(self: Arc<Self>) -> Result<(), MeshError> {
        let subscription = self
            .ctx
            .substrate
            .join_topic(&self.ctx.config.gossip.topic)
            .await?;
        log::info!("gossip: joined {}", subscription.topic());
        self.tasks.spawn(Arc::clone(&self).listen(subscription));
        self.tasks.spawn(Arc::clone(&self).announce_loop());
        self.tasks.spawn(Arc::clone(&self).gc_loop());
        Ok(())
    }

    async fn stop(&self) {
        self.tasks.join(Duration::from_secs(5)).await;
    }
}
