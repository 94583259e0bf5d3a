//! One-frame request/response calls over a fresh stream.

use libp2p::PeerId;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::substrate::{Substrate, SubstrateError};
use crate::wire::{read_message, write_message, WireError};

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

/// Opens `protocol` to `peer`, optionally sends `request`, reads one reply.
///
/// Without a request the write half is closed right away; the responder
/// answers on open.
pub async fn call<Req, Resp>(
    substrate: &dyn Substrate,
    peer: PeerId,
    protocol: &'static str,
    request: Option<&Req>,
    timeout: Duration,
) -> Result<Resp, CallError>
where
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
{
    let exchange = async {
        let mut stream = substrate.open_stream(peer, protocol).await?;
        if let Some(request) = request {
            write_message(&mut stream, request).await?;
        }
        stream.shutdown().await.map_err(WireError::from)?;
        let reply: Resp = read_message(&mut stream).await?;
        Ok::<_, CallError>(reply)
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| CallError::Timeout(timeout))?
}
