//! Structured HTTP proxying over a peer stream.
//!
//! One stream carries one exchange: the caller writes a [`ProxyRequest`]
//! frame and closes its write half, the server answers with one
//! [`ProxyResponse`] frame. The server side walks a fixed sequence of
//! stages for every stream:
//!
//! ```text
//! AWAIT_SLOT -> DECODE_REQUEST -> VALIDATE_HOST -> EXECUTE -> ENCODE_RESPONSE -> CLOSE
//! ```
//!
//! Every stage can short-circuit to `ENCODE_RESPONSE` with a reserved
//! status: no slot gives 600 before anything is read, a bad frame 601, a
//! host this node does not serve 602, an upstream failure 603.

use async_trait::async_trait;
use libp2p::PeerId;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use crate::context::ServiceContext;
use crate::hosts;
use crate::rpc::CallError;
use crate::service::{MeshError, MeshService};
use crate::substrate::{PeerStream, Substrate};
use crate::wire::{
    read_envelope, write_envelope, ProxyRequest, ProxyResponse, WireError, STATUS_BAD_REQUEST,
    STATUS_FORBIDDEN, STATUS_NO_CAPACITY, STATUS_UPSTREAM_FAILED,
};

pub const PROXY_PROTOCOL: &str = "/tuns/proxy/1.0.0";

/// Host part of an absolute URL, if it has one.
pub fn url_host(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    parsed.host_str().map(|h| hosts::host_of(h).to_string())
}

/// Sends `request` to `peer` and reads its answer.
///
/// A failed write does not end the exchange: a busy peer answers without
/// reading, and that answer is still worth having.
pub async fn request_peer(
    substrate: &dyn Substrate,
    peer: PeerId,
    request: &ProxyRequest,
    timeout: Duration,
) -> Result<ProxyResponse, CallError> {
    let exchange = async {
        let mut stream = substrate.open_stream(peer, PROXY_PROTOCOL).await?;
        let sent = write_envelope(&mut stream, request).await;
        let _ = stream.shutdown().await;
        match read_envelope::<_, ProxyResponse>(&mut stream).await {
            Ok(response) => Ok(response),
            Err(read_err) => Err(CallError::Wire(sent.err().unwrap_or(read_err))),
        }
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| CallError::Timeout(timeout))?
}

pub struct ProxyService {
    ctx: ServiceContext,
}

impl ProxyService {
    pub fn new(ctx: ServiceContext) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    /// Checks and runs one decoded request. Never fails: every problem is
    /// reported through a reserved status.
    pub async fn execute(&self, mut request: ProxyRequest) -> ProxyResponse {
        let Some(host) = url_host(&request.url) else {
            return ProxyResponse::reserved(STATUS_BAD_REQUEST, "invalid url");
        };
        if !hosts::any_match(&self.ctx.config.hosts, &host) {
            log::info!("proxy: refusing {}, host not served", host);
            return ProxyResponse::reserved(STATUS_FORBIDDEN, "host is not served by this node");
        }

        request.add_via(&self.ctx.local_peer_id().to_string());
        log::debug!("proxy: executing {} {}", request.method, request.url);
        match self.ctx.upstream.execute(&request).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("proxy: upstream {} failed: {}", request.url, e);
                ProxyResponse::reserved(STATUS_UPSTREAM_FAILED, e.to_string())
            }
        }
    }

    /// Writes `response`. One that cannot be encoded is replaced by a 603,
    /// since encoding fails before any byte reaches the stream.
    async fn respond(&self, stream: &mut PeerStream, response: &ProxyResponse) {
        let sent = match write_envelope(stream, response).await {
            Err(e @ (WireError::Encode(_)
            | WireError::FrameTooLarge { .. }
            | WireError::BodyTooLarge { .. })) => {
                log::warn!("proxy: reply to {} not encodable: {}", stream.peer(), e);
                let fallback = ProxyResponse::reserved(STATUS_UPSTREAM_FAILED, e.to_string());
                write_envelope(stream, &fallback).await
            }
            other => other,
        };
        if let Err(e) = sent {
            log::debug!("proxy: reply to {} failed: {}", stream.peer(), e);
        }
        let _ = stream.shutdown().await;
    }
}

#[async_trait]
impl MeshService for ProxyService {
    fn name(&self) -> &'static str {
        "proxy"
    }

    fn protocol_id(&self) -> Option<&'static str> {
        Some(PROXY_PROTOCOL)
    }

    async fn start(self: Arc<Self>) -> Result<(), MeshError> {
        Ok(())
    }

    async fn handle_stream(self: Arc<Self>, mut stream: PeerStream) {
        let caller = stream.peer();
        let deadline =
            Instant::now() + Duration::from_secs(self.ctx.config.router.request_timeout_secs);
        stream.set_deadline(Some(deadline));

        // AWAIT_SLOT
        let Some(_permit) = self.ctx.admission.try_acquire() else {
            log::debug!("proxy: no slot for {}", caller);
            let busy = ProxyResponse::reserved(STATUS_NO_CAPACITY, "no free slots");
            self.respond(&mut stream, &busy).await;
            return;
        };

        // DECODE_REQUEST
        let request: ProxyRequest = match read_envelope(&mut stream).await {
            Ok(r) => r,
            Err(WireError::Io(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
                log::debug!("proxy: {} never sent a request", caller);
                return;
            }
            Err(e) => {
                log::debug!("proxy: bad request from {}: {}", caller, e);
                let bad = ProxyResponse::reserved(STATUS_BAD_REQUEST, e.to_string());
                self.respond(&mut stream, &bad).await;
                return;
            }
        };

        // VALIDATE_HOST + EXECUTE
        let response = self.execute(request).await;

        // ENCODE_RESPONSE + CLOSE; the slot cools down once `_permit` drops
        self.respond(&mut stream, &response).await;
    }
}
