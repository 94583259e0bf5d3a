//! Request routing: local execution first, then mesh peers.
//!
//! Candidates for a host come from the directory, least recently answered
//! first, and are tried one at a time. Each attempt moves the peer's quality
//! tag: up on an answer, down a little when it was busy, down more when it
//! failed outright.

use libp2p::PeerId;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::context::ServiceContext;
use crate::dialer::TunnelDialer;
use crate::hosts;
use crate::proxy::{request_peer, url_host};
use crate::substrate::{PeerStream, SubstrateError, TagUpdate};
use crate::tunnel::parse_host_port;
use crate::wire::{ProxyRequest, ProxyResponse};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("routing loop: request already passed through this node")]
    Loop,

    #[error("invalid destination: {0}")]
    InvalidUrl(String),

    #[error("no peer serves {host}")]
    NoCandidates { host: String },

    #[error("every peer serving {host} failed, last error: {last_error}")]
    AllCandidatesFailed { host: String, last_error: String },
}

impl RouteError {
    pub fn http_status(&self) -> u16 {
        match self {
            RouteError::Loop => 508,
            RouteError::InvalidUrl(_) => 400,
            RouteError::NoCandidates { .. } => 502,
            RouteError::AllCandidatesFailed { .. } => 502,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RouteError::Loop => "loop_detected",
            RouteError::InvalidUrl(_) => "invalid_url",
            RouteError::NoCandidates { .. } => "no_candidates",
            RouteError::AllCandidatesFailed { .. } => "all_candidates_failed",
        }
    }
}

/// What one candidate did with a request.
#[derive(Debug)]
enum Attempt {
    Served(ProxyResponse),
    Busy,
    Failed(String),
}

#[derive(Clone)]
pub struct ProxyRouter {
    ctx: ServiceContext,
    dialer: TunnelDialer,
}

impl ProxyRouter {
    pub fn new(ctx: ServiceContext) -> Self {
        // the exit dials the destination before it answers
        let tunnel = &ctx.config.tunnel;
        let dialer = TunnelDialer::new(
            ctx.substrate.clone(),
            Duration::from_secs(tunnel.dial_timeout_secs + tunnel.handshake_timeout_secs),
        );
        Self { ctx, dialer }
    }

    pub fn context(&self) -> &ServiceContext {
        &self.ctx
    }

    /// True when this node serves `host` itself.
    pub fn is_local(&self, host: &str) -> bool {
        hosts::any_match(&self.ctx.config.hosts, host)
    }

    pub async fn route(&self, mut request: ProxyRequest) -> Result<ProxyResponse, RouteError> {
        let me = self.ctx.local_peer_id().to_string();
        if request.visited_by(&me) {
            log::warn!("router: loop detected for {}", request.url);
            return Err(RouteError::Loop);
        }
        let host =
            url_host(&request.url).ok_or_else(|| RouteError::InvalidUrl(request.url.clone()))?;
        request.add_via(&me);

        if self.is_local(&host) {
            match self.ctx.upstream.execute(&request).await {
                Ok(response) => return Ok(response),
                Err(e) => log::warn!(
                    "router: local fetch of {} failed, trying peers: {}",
                    request.url,
                    e
                ),
            }
        }

        let mut last_error = None;
        for peer in self.candidates(&host) {
            match self.forward(peer, &request).await {
                Attempt::Served(response) => {
                    self.served(&peer);
                    return Ok(response);
                }
                Attempt::Busy => {
                    self.ctx.adjust_quality(
                        &peer,
                        TagUpdate::Lower(self.ctx.config.quality.busy_penalty),
                    );
                    last_error = Some(format!("{} has no capacity", peer));
                }
                Attempt::Failed(reason) => {
                    self.ctx.adjust_quality(
                        &peer,
                        TagUpdate::Lower(self.ctx.config.quality.failure_penalty),
                    );
                    last_error = Some(reason);
                }
            }
        }
        Err(match last_error {
            None => RouteError::NoCandidates { host },
            Some(last_error) => RouteError::AllCandidatesFailed { host, last_error },
        })
    }

    /// A byte tunnel to `authority` through the first peer that accepts it.
    ///
    /// Success means the peer took the CONNECT line; a refusal after that
    /// arrives as a status line on the returned stream.
    pub async fn open_tunnel(&self, authority: &str) -> Result<PeerStream, RouteError> {
        let (host, _) =
            parse_host_port(authority).map_err(|e| RouteError::InvalidUrl(e.to_string()))?;

        let mut last_error = None;
        for peer in self.candidates(&host) {
            if let Err(e) = self.ensure_connected(peer).await {
                self.ctx.adjust_quality(
                    &peer,
                    TagUpdate::Lower(self.ctx.config.quality.failure_penalty),
                );
                last_error = Some(e.to_string());
                continue;
            }
            match self.dialer.dial(peer, authority).await {
                Ok(stream) => {
                    self.served(&peer);
                    return Ok(stream);
                }
                Err(e) => {
                    log::debug!("router: tunnel via {} failed: {}", peer, e);
                    let quality = &self.ctx.config.quality;
                    let penalty = if e.is_busy() {
                        quality.busy_penalty
                    } else {
                        quality.failure_penalty
                    };
                    self.ctx.adjust_quality(&peer, TagUpdate::Lower(penalty));
                    last_error = Some(e.to_string());
                }
            }
        }
        Err(match last_error {
            None => RouteError::NoCandidates { host },
            Some(last_error) => RouteError::AllCandidatesFailed { host, last_error },
        })
    }

    fn candidates(&self, host: &str) -> Vec<PeerId> {
        let me = self.ctx.local_peer_id();
        let mut candidates = self.ctx.directory.candidates(host);
        candidates.retain(|p| *p != me);
        log::debug!("router: {} candidates for {}", candidates.len(), host);
        candidates
    }

    async fn ensure_connected(&self, peer: PeerId) -> Result<(), SubstrateError> {
        let substrate = &self.ctx.substrate;
        if substrate.is_connected(&peer) {
            return Ok(());
        }
        let limit = Duration::from_secs(self.ctx.config.router.connect_timeout_secs);
        let addrs = substrate.addresses_of(&peer);
        match tokio::time::timeout(limit, substrate.connect(peer, addrs)).await {
            Ok(result) => result,
            Err(_) => Err(SubstrateError::Dial {
                peer,
                reason: format!("timed out after {:?}", limit),
            }),
        }
    }

    async fn forward(&self, peer: PeerId, request: &ProxyRequest) -> Attempt {
        if let Err(e) = self.ensure_connected(peer).await {
            log::debug!("router: cannot reach {}: {}", peer, e);
            return Attempt::Failed(e.to_string());
        }
        let limit = Duration::from_secs(self.ctx.config.router.request_timeout_secs);
        match request_peer(self.ctx.substrate.as_ref(), peer, request, limit).await {
            Ok(response) if response.is_busy() => {
                log::debug!("router: {} is busy", peer);
                Attempt::Busy
            }
            Ok(response) if response.is_reserved() => {
                let detail = String::from_utf8_lossy(&response.body).into_owned();
                log::debug!("router: {} refused with {}: {}", peer, response.status_code, detail);
                Attempt::Failed(format!("{} answered {}: {}", peer, response.status_code, detail))
            }
            Ok(response) => Attempt::Served(response),
            Err(e) => {
                log::debug!("router: request to {} failed: {}", peer, e);
                Attempt::Failed(e.to_string())
            }
        }
    }

    fn served(&self, peer: &PeerId) {
        self.ctx
            .adjust_quality(peer, TagUpdate::Raise(self.ctx.config.quality.reward));
        self.ctx.directory.record_response(peer, Instant::now());
    }
}
