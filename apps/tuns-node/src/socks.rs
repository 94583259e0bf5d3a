//! Local SOCKS5 entry (RFC 1928): CONNECT only, no authentication.
//!
//! Destinations this node serves are dialed directly; everything else goes
//! through a mesh tunnel. Success is reported to the client only once an
//! exit has confirmed that the destination socket is open.

use anyhow::{bail, Context, Result};
use core_mesh::tunnel::{forward_bidirectional, parse_host_port};
use core_mesh::ProxyRouter;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const REPLY_OK: u8 = 0x00;
const REPLY_FAILURE: u8 = 0x01;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_CMD_UNSUPPORTED: u8 = 0x07;
const REPLY_ATYP_UNSUPPORTED: u8 = 0x08;

pub async fn run(listener: TcpListener, router: ProxyRouter) -> Result<()> {
    info!(addr = %listener.local_addr()?, "SOCKS5 entry listening");
    loop {
        let (inbound, peer) = listener.accept().await?;
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_client(inbound, &router).await {
                debug!(%peer, error = %e, "socks client closed with error");
            }
        });
    }
}

async fn serve_client(mut inbound: TcpStream, router: &ProxyRouter) -> Result<()> {
    let authority = negotiate(&mut inbound).await?;
    let (host, port) = parse_host_port(&authority)?;
    let config = &router.context().config;
    let idle = config.tunnel.idle_timeout_secs;

    if router.is_local(&host) {
        let dial = Duration::from_secs(config.tunnel.dial_timeout_secs);
        let connect = tokio::time::timeout(dial, TcpStream::connect((host.as_str(), port))).await;
        let mut outbound = match connect {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                send_reply(&mut inbound, REPLY_HOST_UNREACHABLE).await?;
                return Err(e).with_context(|| format!("connect {authority}"));
            }
            Err(_) => {
                send_reply(&mut inbound, REPLY_HOST_UNREACHABLE).await?;
                bail!("connect {authority} timed out");
            }
        };
        send_reply(&mut inbound, REPLY_OK).await?;
        debug!(%authority, "direct");
        forward_bidirectional(&mut inbound, &mut outbound, idle).await?;
        return Ok(());
    }

    match router.open_tunnel(&authority).await {
        Ok(mut tunnel) => {
            send_reply(&mut inbound, REPLY_OK).await?;
            debug!(%authority, via = %tunnel.peer(), "tunneled");
            forward_bidirectional(&mut inbound, &mut tunnel, idle).await?;
            Ok(())
        }
        Err(e) => {
            warn!(%authority, error = %e, "no tunnel");
            send_reply(&mut inbound, REPLY_FAILURE).await?;
            Err(e.into())
        }
    }
}

/// Runs the method and request exchange and returns the target as
/// `host:port`. Unsupported commands and address types are answered before
/// failing.
async fn negotiate<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ver = stream.read_u8().await?;
    if ver != 0x05 {
        bail!("unsupported version {ver}");
    }
    let nmethods = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[0x05, 0x00]).await?;

    let ver = stream.read_u8().await?;
    if ver != 0x05 {
        bail!("bad request version {ver}");
    }
    let cmd = stream.read_u8().await?;
    let _rsv = stream.read_u8().await?;
    let atyp = stream.read_u8().await?;
    if cmd != 0x01 {
        send_reply(stream, REPLY_CMD_UNSUPPORTED).await?;
        bail!("unsupported command {cmd}");
    }

    let target = match atyp {
        0x01 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            format!("{}:{}", std::net::Ipv4Addr::from(ip), port)
        }
        0x03 => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let port = stream.read_u16().await?;
            format!("{}:{}", String::from_utf8_lossy(&name), port)
        }
        0x04 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            format!("[{}]:{}", std::net::Ipv6Addr::from(ip), port)
        }
        _ => {
            send_reply(stream, REPLY_ATYP_UNSUPPORTED).await?;
            bail!("unsupported address type {atyp}");
        }
    };
    Ok(target)
}

async fn send_reply<S: AsyncWrite + Unpin>(stream: &mut S, rep: u8) -> Result<()> {
    // BND.ADDR 0.0.0.0, BND.PORT 0
    stream
        .write_all(&[0x05, rep, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    stream.flush().await?;
    Ok(())
}
