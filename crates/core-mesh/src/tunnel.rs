//! Raw byte tunnels over a peer stream.
//!
//! The caller opens the tunnel protocol and writes a single line naming the
//! destination, then treats the stream as a plain socket:
//!
//! ```text
//! CONNECT host:port[ HTTP/1.1]\n
//! <opaque bytes in both directions>
//! ```
//!
//! The exit answers with one `HTTP/1.1 <status> <reason>\r\n\r\n` line.
//! Status 200 means the destination socket is open and every byte after the
//! line belongs to the tunnel. Any other status is reserved and the stream
//! closes right behind it. Bytes the caller sends right behind the CONNECT
//! line are kept and forwarded.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

use crate::context::ServiceContext;
use crate::hosts;
use crate::service::{MeshError, MeshService};
use crate::substrate::PeerStream;
use crate::wire::{
    reason_phrase, STATUS_BAD_REQUEST, STATUS_FORBIDDEN, STATUS_NO_CAPACITY,
    STATUS_UPSTREAM_FAILED,
};

pub const TUNNEL_PROTOCOL: &str = "/tuns/tunnel/1.0.0";

/// Longest CONNECT line accepted, terminator included.
pub const MAX_CONNECT_LINE: usize = 8192;

/// Longest status reply a caller reads before giving up.
pub const MAX_STATUS_REPLY: usize = 512;

/// Status of the reply that opens a tunnel.
pub const STATUS_ESTABLISHED: u16 = 200;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid CONNECT request: {0}")]
    InvalidConnect(String),

    #[error("No free admission slot")]
    NoCapacity,

    #[error("Host not served: {host}")]
    Forbidden { host: String },

    #[error("Connect to {host}:{port} failed: {source}")]
    ConnectFailed {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Timeout after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Malformed status reply: {0}")]
    BadReply(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Reserved status sent back for a refused tunnel.
    pub fn status(&self) -> u16 {
        match self {
            TunnelError::InvalidConnect(_) => STATUS_BAD_REQUEST,
            TunnelError::NoCapacity => STATUS_NO_CAPACITY,
            TunnelError::Forbidden { .. } => STATUS_FORBIDDEN,
            TunnelError::ConnectFailed { .. } => STATUS_UPSTREAM_FAILED,
            TunnelError::Timeout { .. } => STATUS_UPSTREAM_FAILED,
            TunnelError::BadReply(_) => STATUS_UPSTREAM_FAILED,
            TunnelError::Io(_) => STATUS_UPSTREAM_FAILED,
        }
    }

    /// The status line written before closing.
    pub fn rejection(&self) -> Vec<u8> {
        rejection_line(self.status()).into_bytes()
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            TunnelError::InvalidConnect(_) => "invalid_connect",
            TunnelError::NoCapacity => "no_capacity",
            TunnelError::Forbidden { .. } => "forbidden",
            TunnelError::ConnectFailed { .. } => "connect_failed",
            TunnelError::Timeout { .. } => "timeout",
            TunnelError::BadReply(_) => "bad_reply",
            TunnelError::Io(_) => "io_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

pub fn rejection_line(status: u16) -> String {
    format!("HTTP/1.1 {} {}\r\n\r\n", status, reason_phrase(status))
}

pub fn established_line() -> String {
    format!("HTTP/1.1 {} Connection Established\r\n\r\n", STATUS_ESTABLISHED)
}

/// Parses a status line back into its status, if `line` is one.
pub fn parse_status_line(line: &str) -> Option<u16> {
    let mut parts = line.trim_end().splitn(3, ' ');
    if parts.next()? != "HTTP/1.1" {
        return None;
    }
    parts.next()?.parse().ok()
}

/// Reads the exit's status reply and returns its status.
///
/// Reads one byte at a time so nothing behind the blank line is consumed;
/// those bytes already belong to the tunnel.
pub async fn read_status_reply<R>(reader: &mut R) -> Result<u16>
where
    R: AsyncRead + Unpin,
{
    let mut reply = Vec::with_capacity(64);
    while !reply.ends_with(b"\r\n\r\n") {
        if reply.len() >= MAX_STATUS_REPLY {
            return Err(TunnelError::BadReply(format!(
                "no end of reply within {} bytes",
                MAX_STATUS_REPLY
            )));
        }
        reply.push(reader.read_u8().await?);
    }
    let text = std::str::from_utf8(&reply)
        .map_err(|_| TunnelError::BadReply("Not UTF-8".to_string()))?;
    parse_status_line(text).ok_or_else(|| TunnelError::BadReply(text.trim_end().to_string()))
}

/// Reads the CONNECT line, leaving anything after it in `reader`.
pub async fn read_connect_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut limited = reader.take(MAX_CONNECT_LINE as u64);
    limited.read_until(b'\n', &mut line).await?;
    if line.last() != Some(&b'\n') {
        return Err(TunnelError::InvalidConnect(if line.len() >= MAX_CONNECT_LINE {
            format!("Request too large (max: {} bytes)", MAX_CONNECT_LINE)
        } else {
            "Incomplete request".to_string()
        }));
    }
    String::from_utf8(line).map_err(|_| TunnelError::InvalidConnect("Not UTF-8".to_string()))
}

/// Parses `CONNECT host:port`, with an optional trailing HTTP version.
pub fn parse_connect_line(line: &str) -> Result<(String, u16)> {
    let mut parts = line.trim_end_matches(['\r', '\n']).split_whitespace();
    match parts.next() {
        Some("CONNECT") => {}
        Some(other) => {
            return Err(TunnelError::InvalidConnect(format!(
                "Expected CONNECT, got {}",
                other
            )))
        }
        None => return Err(TunnelError::InvalidConnect("Empty request".to_string())),
    }
    let target = parts
        .next()
        .ok_or_else(|| TunnelError::InvalidConnect("Missing target".to_string()))?;
    match parts.next() {
        None => {}
        Some(version) if version.starts_with("HTTP/") => {}
        Some(other) => {
            return Err(TunnelError::InvalidConnect(format!(
                "Unexpected token '{}'",
                other
            )))
        }
    }
    if parts.next().is_some() {
        return Err(TunnelError::InvalidConnect("Trailing data".to_string()));
    }
    parse_host_port(target)
}

/// Parse "host:port" (or "[v6]:port") into components.
pub fn parse_host_port(target: &str) -> Result<(String, u16)> {
    let (host, port_str) = target.rsplit_once(':').ok_or_else(|| {
        TunnelError::InvalidConnect(format!(
            "Invalid target format, expected 'host:port', got '{}'",
            target
        ))
    })?;

    let port: u16 = port_str
        .parse()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| TunnelError::InvalidConnect(format!("Invalid port number: '{}'", port_str)))?;

    let host = match host.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']').ok_or_else(|| {
            TunnelError::InvalidConnect(format!("Unbalanced brackets in '{}'", target))
        })?,
        // a bare v6 literal would be ambiguous with the port
        None if host.contains(':') => {
            return Err(TunnelError::InvalidConnect(format!(
                "IPv6 hosts need brackets: '{}'",
                target
            )))
        }
        None => host,
    };

    if host.is_empty() {
        return Err(TunnelError::InvalidConnect("Empty hostname".to_string()));
    }

    Ok((host.to_string(), port))
}

/// Copies between two streams until both sides close or `session_timeout_secs`
/// runs out. Returns (bytes_to_dest, bytes_from_dest).
pub async fn forward_bidirectional<S1, S2>(
    stream1: &mut S1,
    stream2: &mut S2,
    session_timeout_secs: u64,
) -> Result<(u64, u64)>
where
    S1: AsyncRead + AsyncWrite + Unpin,
    S2: AsyncRead + AsyncWrite + Unpin,
{
    let limit = Duration::from_secs(session_timeout_secs);
    match timeout(limit, tokio::io::copy_bidirectional(stream1, stream2)).await {
        Ok(Ok((to_dest, from_dest))) => {
            log::debug!("tunnel: closed after {} bytes out, {} in", to_dest, from_dest);
            Ok((to_dest, from_dest))
        }
        Ok(Err(e)) => {
            log::debug!("tunnel: forwarding error: {}", e);
            Err(TunnelError::Io(e))
        }
        Err(_) => {
            log::debug!("tunnel: session timeout");
            Err(TunnelError::Timeout {
                timeout_secs: session_timeout_secs,
            })
        }
    }
}

pub struct TunnelService {
    ctx: ServiceContext,
}

impl TunnelService {
    pub fn new(ctx: ServiceContext) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    /// Reads and checks the CONNECT line, then dials the destination.
    async fn open(&self, reader: &mut BufReader<PeerStream>) -> Result<TcpStream> {
        let cfg = &self.ctx.config.tunnel;
        let handshake = Instant::now() + Duration::from_secs(cfg.handshake_timeout_secs);
        reader.get_mut().set_read_deadline(Some(handshake));
        let line = read_connect_line(reader).await.map_err(|e| match e {
            TunnelError::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => {
                TunnelError::Timeout {
                    timeout_secs: cfg.handshake_timeout_secs,
                }
            }
            other => other,
        })?;
        reader.get_mut().set_read_deadline(None);

        let (host, port) = parse_connect_line(&line)?;
        if !hosts::any_match(&self.ctx.config.hosts, &host) {
            return Err(TunnelError::Forbidden { host });
        }

        let dial = TcpStream::connect((host.as_str(), port));
        match timeout(Duration::from_secs(cfg.dial_timeout_secs), dial).await {
            Ok(Ok(socket)) => Ok(socket),
            Ok(Err(source)) => Err(TunnelError::ConnectFailed { host, port, source }),
            Err(_) => Err(TunnelError::Timeout {
                timeout_secs: cfg.dial_timeout_secs,
            }),
        }
    }

    async fn accept_tunnel(&self, reader: &mut BufReader<PeerStream>) -> std::io::Result<()> {
        let stream = reader.get_mut();
        stream.write_all(established_line().as_bytes()).await?;
        stream.flush().await
    }

    async fn reject(&self, reader: &mut BufReader<PeerStream>, err: &TunnelError) {
        let stream = reader.get_mut();
        stream.set_write_deadline(Some(Instant::now() + Duration::from_secs(5)));
        let _ = stream.write_all(&err.rejection()).await;
        let _ = stream.shutdown().await;
    }
}

#[async_trait]
impl MeshService for TunnelService {
    fn name(&self) -> &'static str {
        "tunnel"
    }

    fn protocol_id(&self) -> Option<&'static str> {
        Some(TUNNEL_PROTOCOL)
    }

    async fn start(self: Arc<Self>) -> std::result::Result<(), MeshError> {
        Ok(())
    }

    async fn handle_stream(self: Arc<Self>, stream: PeerStream) {
        let caller = stream.peer();
        let mut reader = BufReader::new(stream);

        let Some(_permit) = self.ctx.admission.try_acquire() else {
            self.reject(&mut reader, &TunnelError::NoCapacity).await;
            return;
        };

        let mut socket = match self.open(&mut reader).await {
            Ok(socket) => socket,
            Err(e) => {
                log::info!("tunnel: refused {} ({}): {}", caller, e.type_name(), e);
                self.reject(&mut reader, &e).await;
                return;
            }
        };

        if let Err(e) = self.accept_tunnel(&mut reader).await {
            log::debug!("tunnel: {} left before the tunnel opened: {}", caller, e);
            return;
        }

        let session = self.ctx.config.tunnel.idle_timeout_secs;
        tokio::select! {
            _ = self.ctx.shutdown.cancelled() => {}
            result = forward_bidirectional(&mut reader, &mut socket, session) => {
                if let Err(e) = result {
                    log::debug!("tunnel: session with {} ended: {}", caller, e);
                }
            }
        }
    }
}
