//! Wire messages and framing.
//!
//! Structured messages travel one per frame:
//!
//! ```text
//! +--------+-----------+
//! | Length | JSON body |
//! | 4B BE  | var       |
//! +--------+-----------+
//! ```
//!
//! Proxy requests and responses carry their body raw, right behind the
//! JSON head:
//!
//! ```text
//! +--------+-----------+--------+-----------+
//! | Length | JSON head | Length | body      |
//! | 4B BE  | var       | 4B BE  | var       |
//! +--------+-----------+--------+-----------+
//! ```
//!
//! Gossip payloads are a bare JSON document since the topic already
//! delimits messages.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (1 MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum raw body behind a proxy message head (64 MB)
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// The peer has no free admission slot.
pub const STATUS_NO_CAPACITY: u16 = 600;
/// The request could not be decoded.
pub const STATUS_BAD_REQUEST: u16 = 601;
/// The destination host is not served by the peer.
pub const STATUS_FORBIDDEN: u16 = 602;
/// The peer failed to execute the request against the destination.
pub const STATUS_UPSTREAM_FAILED: u16 = 603;

/// Header listing every node that already handled a request.
pub const VIA_HEADER: &str = "X-Tuns-Via";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame too large: {size} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge { size: usize },

    #[error("body too large: {size} bytes (max {MAX_BODY_SIZE})")]
    BodyTooLarge { size: usize },

    #[error("encoding failed: {0}")]
    Encode(String),

    #[error("decoding failed: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Reserved statuses are never produced by an upstream server.
pub fn is_reserved(status: u16) -> bool {
    (STATUS_NO_CAPACITY..=STATUS_UPSTREAM_FAILED).contains(&status)
}

pub fn is_busy(status: u16) -> bool {
    status == STATUS_NO_CAPACITY
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        STATUS_NO_CAPACITY => "No Capacity",
        STATUS_BAD_REQUEST => "Bad Tunnel Request",
        STATUS_FORBIDDEN => "Host Not Served",
        STATUS_UPSTREAM_FAILED => "Upstream Failed",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub peer_id: String,
    pub hosts: Vec<String>,
    pub timestamp: i64,
}

impl PeerAnnouncement {
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(|e| WireError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(|e| WireError::Decode(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl ProxyRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            ..Default::default()
        }
    }

    /// Header lookup, ignoring name case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True when `node` already handled this request.
    pub fn visited_by(&self, node: &str) -> bool {
        self.header(VIA_HEADER)
            .map(|via| via.split(',').any(|hop| hop.trim() == node))
            .unwrap_or(false)
    }

    /// Appends `node` to the via chain, merging any differently-cased key.
    pub fn add_via(&mut self, node: &str) {
        let existing: Vec<String> = self
            .headers
            .keys()
            .filter(|k| k.eq_ignore_ascii_case(VIA_HEADER))
            .cloned()
            .collect();
        let mut hops: Vec<String> = Vec::new();
        for key in existing {
            if let Some(value) = self.headers.remove(&key) {
                hops.extend(
                    value
                        .split(',')
                        .map(|h| h.trim().to_string())
                        .filter(|h| !h.is_empty()),
                );
            }
        }
        if !hops.iter().any(|h| h == node) {
            hops.push(node.to_string());
        }
        self.headers.insert(VIA_HEADER.to_string(), hops.join(", "));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl ProxyResponse {
    /// A reserved-status reply with a plain-text explanation as body.
    pub fn reserved(status: u16, detail: impl Into<String>) -> Self {
        Self {
            status_code: status,
            headers: BTreeMap::new(),
            body: detail.into().into_bytes(),
        }
    }

    pub fn is_busy(&self) -> bool {
        is_busy(self.status_code)
    }

    pub fn is_reserved(&self) -> bool {
        is_reserved(self.status_code)
    }
}

/// Messages whose body travels raw behind the JSON head.
pub trait CarriesBody: Serialize + DeserializeOwned {
    fn body(&self) -> &[u8];
    fn set_body(&mut self, body: Vec<u8>);
}

impl CarriesBody for ProxyRequest {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }
}

impl CarriesBody for ProxyResponse {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }
}

/// A capability-exchange entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangedPeer {
    pub peer_id: String,
    pub hosts: Vec<String>,
    pub timestamp: i64,
    /// Unix seconds of the replier's last sighting.
    pub last_seen: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityExchangeReply {
    pub peers: Vec<ExchangedPeer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub peer_id: String,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressExchangeReply {
    pub peers: Vec<AddressRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingReply {
    pub version: String,
    pub provided_hosts: Vec<String>,
}

/// Encode `msg` into a length-prefixed frame.
pub fn encode_frame<M: Serialize>(msg: &M) -> Result<Vec<u8>, WireError> {
    let body = serde_json::to_vec(msg).map_err(|e| WireError::Encode(e.to_string()))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge { size: body.len() });
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode one complete frame produced by [`encode_frame`].
pub fn decode_frame<M: DeserializeOwned>(buf: &[u8]) -> Result<M, WireError> {
    if buf.len() < 4 {
        return Err(WireError::Decode("frame too short".to_string()));
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge { size: len });
    }
    if buf.len() - 4 != len {
        return Err(WireError::Decode(format!(
            "length prefix says {} bytes, got {}",
            len,
            buf.len() - 4
        )));
    }
    serde_json::from_slice(&buf[4..]).map_err(|e| WireError::Decode(e.to_string()))
}

/// Encode a head frame followed by the raw body. Fails before producing
/// any bytes when either part is over its limit.
pub fn encode_envelope<M: CarriesBody>(msg: &M) -> Result<Vec<u8>, WireError> {
    let body = msg.body();
    if body.len() > MAX_BODY_SIZE {
        return Err(WireError::BodyTooLarge { size: body.len() });
    }
    let mut out = encode_frame(msg)?;
    out.reserve(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Decode one complete envelope produced by [`encode_envelope`].
pub fn decode_envelope<M: CarriesBody>(buf: &[u8]) -> Result<M, WireError> {
    let prefix = buf
        .get(..4)
        .ok_or_else(|| WireError::Decode("envelope too short".to_string()))?;
    let head_len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if head_len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge { size: head_len });
    }
    let (head, rest) = match buf.len().checked_sub(4 + head_len) {
        Some(_) => buf.split_at(4 + head_len),
        None => return Err(WireError::Decode("truncated head".to_string())),
    };
    let mut msg: M = decode_frame(head)?;
    if rest.len() < 4 {
        return Err(WireError::Decode("missing body length".to_string()));
    }
    let body_len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
    if body_len > MAX_BODY_SIZE {
        return Err(WireError::BodyTooLarge { size: body_len });
    }
    if rest.len() - 4 != body_len {
        return Err(WireError::Decode(format!(
            "body length says {} bytes, got {}",
            body_len,
            rest.len() - 4
        )));
    }
    msg.set_body(rest[4..].to_vec());
    Ok(msg)
}

/// Write a message to an async stream.
pub async fn write_message<T, M>(stream: &mut T, msg: &M) -> Result<(), WireError>
where
    T: AsyncWrite + Unpin,
    M: Serialize,
{
    let frame = encode_frame(msg)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a message from an async stream.
pub async fn read_message<T, M>(stream: &mut T) -> Result<M, WireError>
where
    T: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge { size: len });
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(|e| WireError::Decode(e.to_string()))
}

/// Write a proxy message and its body to an async stream.
pub async fn write_envelope<T, M>(stream: &mut T, msg: &M) -> Result<(), WireError>
where
    T: AsyncWrite + Unpin,
    M: CarriesBody,
{
    let body = msg.body();
    if body.len() > MAX_BODY_SIZE {
        return Err(WireError::BodyTooLarge { size: body.len() });
    }
    let head = encode_frame(msg)?;
    stream.write_all(&head).await?;
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a proxy message and its body from an async stream.
pub async fn read_envelope<T, M>(stream: &mut T) -> Result<M, WireError>
where
    T: AsyncRead + Unpin,
    M: CarriesBody,
{
    let mut msg: M = read_message(stream).await?;
    let len = stream.read_u32().await? as usize;
    if len > MAX_BODY_SIZE {
        return Err(WireError::BodyTooLarge { size: len });
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    msg.set_body(body);
    Ok(msg)
}

/// Current wall-clock time in unix seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
