//! Client side of [`crate::tunnel`]: peer streams that act like sockets.

use libp2p::PeerId;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::substrate::{PeerStream, Substrate, SubstrateError};
use crate::tunnel::{read_status_reply, TunnelError, STATUS_ESTABLISHED, TUNNEL_PROTOCOL};
use crate::wire;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("opening tunnel stream failed: {0}")]
    Open(#[from] SubstrateError),

    #[error("sending CONNECT line failed: {0}")]
    Handshake(#[from] std::io::Error),

    #[error("reading the exit's reply failed: {0}")]
    Reply(#[from] TunnelError),

    #[error("exit refused the tunnel with status {0}")]
    Refused(u16),

    #[error("tunnel dial timed out after {0:?}")]
    Timeout(Duration),
}

impl DialError {
    /// The exit had no free slot; the peer itself is fine.
    pub fn is_busy(&self) -> bool {
        matches!(self, DialError::Refused(status) if wire::is_busy(*status))
    }
}

/// Opens byte tunnels to destinations through mesh peers.
#[derive(Clone)]
pub struct TunnelDialer {
    substrate: Arc<dyn Substrate>,
    timeout: Duration,
}

impl TunnelDialer {
    pub fn new(substrate: Arc<dyn Substrate>, timeout: Duration) -> Self {
        Self { substrate, timeout }
    }

    /// A stream to `authority` (`host:port`) relayed by `peer`.
    ///
    /// Returns once the exit confirms the destination socket is open. The
    /// timeout covers the exit's own dial, so it should exceed it.
    ///
    /// The reply is read even when the CONNECT line could not be written: a
    /// busy exit refuses without reading.
    pub async fn dial(&self, peer: PeerId, authority: &str) -> Result<PeerStream, DialError> {
        let handshake = async {
            let mut stream = self.substrate.open_stream(peer, TUNNEL_PROTOCOL).await?;
            let line = format!("CONNECT {}\n", authority);
            let sent = async {
                stream.write_all(line.as_bytes()).await?;
                stream.flush().await?;
                Ok::<_, std::io::Error>(())
            }
            .await;
            match read_status_reply(&mut stream).await {
                Ok(STATUS_ESTABLISHED) => {
                    sent?;
                    Ok::<_, DialError>(stream)
                }
                Ok(status) => Err(DialError::Refused(status)),
                Err(e) => Err(match sent {
                    Err(write_err) => DialError::Handshake(write_err),
                    Ok(()) => DialError::Reply(e),
                }),
            }
        };
        tokio::time::timeout(self.timeout, handshake)
            .await
            .map_err(|_| DialError::Timeout(self.timeout))?
    }
}
