//! Handshake between freshly connected nodes.
//!
//! The responder answers on open with its version and served hosts; the
//! caller times the round trip and records what the peer serves.

use async_trait::async_trait;
use libp2p::PeerId;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;

use crate::context::ServiceContext;
use crate::directory::{MergeOutcome, RecordSource};
use crate::rpc::{self, CallError};
use crate::service::{MeshError, MeshService};
use crate::substrate::{PeerStream, TagUpdate};
use crate::wire::{unix_now, write_message, PingReply};

pub const PING_PROTOCOL: &str = "/tuns/ping/1.0.0";

const PING_TIMEOUT: Duration = Duration::from_secs(10);
/// Delay before pinging back an unknown caller, so its side has settled.
const PING_BACK_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct PingResult {
    pub reply: PingReply,
    pub latency: Duration,
}

/// Pings `peer` and merges the hosts it reports into the directory.
pub async fn ping_peer(ctx: &ServiceContext, peer: PeerId) -> Result<PingResult, CallError> {
    let started = Instant::now();
    let reply: PingReply =
        rpc::call::<(), _>(ctx.substrate.as_ref(), peer, PING_PROTOCOL, None, PING_TIMEOUT).await?;
    let latency = started.elapsed();
    let now = Instant::now();

    if reply.provided_hosts.is_empty() {
        ctx.directory.touch(&peer, now);
    } else {
        let outcome = ctx.directory.merge(
            peer,
            reply.provided_hosts.clone(),
            unix_now(),
            RecordSource::Connect,
            now,
        );
        if outcome == MergeOutcome::Inserted {
            ctx.adjust_quality(&peer, TagUpdate::Seed(ctx.config.quality.seed_sighting));
        }
    }
    log::debug!("ping: {} v{} in {:?}", peer, reply.version, latency);
    Ok(PingResult { reply, latency })
}

pub struct PingService {
    ctx: ServiceContext,
}

impl PingService {
    pub fn new(ctx: ServiceContext) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    fn reply(&self) -> PingReply {
        PingReply {
            version: self.ctx.config.version.clone(),
            provided_hosts: self.ctx.config.hosts.clone(),
        }
    }
}

#[async_trait]
impl MeshService for PingService {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn protocol_id(&self) -> Option<&'static str> {
        Some(PING_PROTOCOL)
    }

    async fn start(self: Arc<Self>) -> Result<(), MeshError> {
        Ok(())
    }

    async fn handle_stream(self: Arc<Self>, mut stream: PeerStream) {
        let caller = stream.peer();
        stream.set_deadline(Some(Instant::now() + PING_TIMEOUT));
        if let Err(e) = write_message(&mut stream, &self.reply()).await {
            log::debug!("ping: reply to {} failed: {}", caller, e);
            return;
        }
        // wait for the caller to close its side
        let mut sink = [0u8; 64];
        let _ = stream.read(&mut sink).await;

        if !self.ctx.directory.contains(&caller) {
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if !ctx.pause(PING_BACK_DELAY).await {
                    return;
                }
                if let Err(e) = ping_peer(&ctx, caller).await {
                    log::debug!("ping: ping back to {} failed: {}", caller, e);
                }
            });
        }
    }
}
