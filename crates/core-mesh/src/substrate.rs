//! Transport substrate abstraction.
//!
//! The mesh services never touch libp2p directly. They talk to a
//! [`Substrate`]: authenticated multiplexed connections, per-protocol stream
//! handlers, an address book, a connection-quality tag store, topics and DHT
//! lookups. [`crate::swarm::SwarmSubstrate`] implements it over a libp2p
//! swarm, [`crate::memory::MemoryNetwork`] in process for tests.

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};

use crate::events::EventSubscription;

pub const TAG_MIN: i32 = 0;
pub const TAG_MAX: i32 = 100;

#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("dial to {peer} failed: {reason}")]
    Dial { peer: PeerId, reason: String },

    #[error("peer not connected: {0}")]
    NotConnected(PeerId),

    #[error("no known address for {0}")]
    NoAddresses(PeerId),

    #[error("opening {protocol} stream to {peer} failed: {reason}")]
    Stream {
        peer: PeerId,
        protocol: &'static str,
        reason: String,
    },

    #[error("protocol {0} already has a handler")]
    AlreadyRegistered(&'static str),

    #[error("topic error: {0}")]
    Topic(String),

    #[error("DHT error: {0}")]
    Dht(String),

    #[error("transport setup failed: {0}")]
    Setup(String),

    #[error("substrate is shut down")]
    Shutdown,
}

/// A pure adjustment of a quality tag, applied under the tag store's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagUpdate {
    /// Set an absent tag, or raise a lower one, to this value.
    Seed(i32),
    Raise(i32),
    Lower(i32),
}

impl TagUpdate {
    pub fn apply(self, current: Option<i32>) -> i32 {
        let next = match self {
            TagUpdate::Seed(value) => current.map_or(value, |c| c.max(value)),
            TagUpdate::Raise(delta) => current.unwrap_or(TAG_MIN).saturating_add(delta),
            TagUpdate::Lower(delta) => current.unwrap_or(TAG_MIN).saturating_sub(delta),
        };
        next.clamp(TAG_MIN, TAG_MAX)
    }
}

/// Per-peer named integer tags with an atomic read-compute-write update.
#[derive(Debug, Default)]
pub struct TagStore {
    tags: Mutex<HashMap<PeerId, HashMap<String, i32>>>,
}

impl TagStore {
    pub fn update(&self, peer: &PeerId, tag: &str, update: TagUpdate) -> i32 {
        let mut tags = self.tags.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = tags.entry(*peer).or_default();
        let next = update.apply(entry.get(tag).copied());
        entry.insert(tag.to_string(), next);
        next
    }

    pub fn get(&self, peer: &PeerId, tag: &str) -> Option<i32> {
        self.tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .and_then(|t| t.get(tag).copied())
    }

    /// Drops every tag on `peer`. Returns whether it had any.
    pub fn remove(&self, peer: &PeerId) -> bool {
        self.tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.tags.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of every tag on `peer`; the retention weight.
    pub fn weight(&self, peer: &PeerId) -> i32 {
        self.tags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .map(|t| t.values().sum())
            .unwrap_or(0)
    }
}

/// Anything usable as the byte pipe under a [`PeerStream`].
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// A bidirectional stream to a peer under one protocol.
///
/// Behaves like a connected socket: it knows both endpoint addresses and
/// honours read and write deadlines, failing with `TimedOut` once one
/// passes.
pub struct PeerStream {
    peer: PeerId,
    protocol: &'static str,
    local_addr: Option<Multiaddr>,
    remote_addr: Option<Multiaddr>,
    io: Box<dyn StreamIo>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerStream")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl PeerStream {
    pub fn new(peer: PeerId, protocol: &'static str, io: impl StreamIo + 'static) -> Self {
        Self {
            peer,
            protocol,
            local_addr: None,
            remote_addr: None,
            io: Box::new(io),
            read_deadline: None,
            write_deadline: None,
        }
    }

    pub fn with_addrs(mut self, local: Option<Multiaddr>, remote: Option<Multiaddr>) -> Self {
        self.local_addr = local;
        self.remote_addr = remote;
        self
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    pub fn local_addr(&self) -> Option<&Multiaddr> {
        self.local_addr.as_ref()
    }

    pub fn remote_addr(&self) -> Option<&Multiaddr> {
        self.remote_addr.as_ref()
    }

    /// Sets both deadlines; `None` clears them.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
    }

    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
    }
}

fn deadline_passed(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    match deadline {
        Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
        None => false,
    }
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{what} deadline exceeded"))
}

impl AsyncRead for PeerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if deadline_passed(&mut this.read_deadline, cx) {
            return Poll::Ready(Err(timed_out("read")));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for PeerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if deadline_passed(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(timed_out("write")));
        }
        Pin::new(&mut this.io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if deadline_passed(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(timed_out("write")));
        }
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// Inbound streams for one registered protocol.
pub type InboundStreams = mpsc::Receiver<PeerStream>;

/// A DHT provider as reported by a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

/// Providers arrive as the lookup progresses; the channel closes when it ends.
pub type ProviderStream = mpsc::Receiver<PeerDescriptor>;

#[derive(Debug, Clone)]
pub struct TopicMessage {
    /// Author of the message, when the topic carries signed messages.
    pub source: Option<PeerId>,
    pub data: Vec<u8>,
}

/// A joined topic. Messages authored locally are not delivered.
#[derive(Debug)]
pub struct TopicSubscription {
    topic: String,
    rx: mpsc::Receiver<TopicMessage>,
}

impl TopicSubscription {
    pub fn new(topic: impl Into<String>, rx: mpsc::Receiver<TopicMessage>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next message; `None` once the substrate shut down.
    pub async fn next(&mut self) -> Option<TopicMessage> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Substrate: Send + Sync + 'static {
    fn local_peer_id(&self) -> PeerId;

    fn listen_addrs(&self) -> Vec<Multiaddr>;

    fn connected_peers(&self) -> Vec<PeerId>;

    fn is_connected(&self, peer: &PeerId) -> bool;

    /// Known dialable addresses of `peer`.
    fn addresses_of(&self, peer: &PeerId) -> Vec<Multiaddr>;

    /// Every peer the address book holds addresses for.
    fn known_peers(&self) -> Vec<PeerId>;

    fn add_addresses(&self, peer: PeerId, addrs: Vec<Multiaddr>, ttl: Duration);

    /// Protocols `peer` advertised during identification.
    fn protocols_of(&self, peer: &PeerId) -> Vec<String>;

    fn update_tag(&self, peer: &PeerId, tag: &str, update: TagUpdate) -> i32;

    fn tag(&self, peer: &PeerId, tag: &str) -> Option<i32>;

    /// Forgets every tag on `peer`, once nothing tracks it any more.
    fn clear_tags(&self, peer: &PeerId);

    fn subscribe_events(&self) -> EventSubscription;

    /// Registers the single handler for `protocol`.
    fn accept(&self, protocol: &'static str) -> Result<InboundStreams, SubstrateError>;

    async fn join_topic(&self, topic: &str) -> Result<TopicSubscription, SubstrateError>;

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), SubstrateError>;

    /// Connects to `peer`, using `addrs` in addition to the address book.
    async fn connect(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<(), SubstrateError>;

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: &'static str,
    ) -> Result<PeerStream, SubstrateError>;

    async fn provide(&self, key: Vec<u8>) -> Result<(), SubstrateError>;

    async fn find_providers(
        &self,
        key: Vec<u8>,
        limit: usize,
    ) -> Result<ProviderStream, SubstrateError>;

    async fn find_peer(&self, peer: PeerId) -> Result<Vec<Multiaddr>, SubstrateError>;

    async fn bootstrap(&self) -> Result<(), SubstrateError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn tag_updates_clamp() {
        assert_eq!(TagUpdate::Seed(60).apply(None), 60);
        assert_eq!(TagUpdate::Seed(60).apply(Some(80)), 80);
        assert_eq!(TagUpdate::Seed(60).apply(Some(10)), 60);
        assert_eq!(TagUpdate::Raise(10).apply(Some(95)), TAG_MAX);
        assert_eq!(TagUpdate::Lower(20).apply(Some(5)), TAG_MIN);
        assert_eq!(TagUpdate::Lower(20).apply(None), TAG_MIN);
        assert_eq!(TagUpdate::Raise(10).apply(None), 10);
    }

    #[test]
    fn repeated_failures_floor_at_zero() {
        let store = TagStore::default();
        let peer = PeerId::random();
        store.update(&peer, "t", TagUpdate::Seed(100));
        let mut last = 100;
        for _ in 0..20 {
            let next = store.update(&peer, "t", TagUpdate::Lower(20));
            assert!(next <= last);
            assert!(next >= TAG_MIN);
            last = next;
        }
        assert_eq!(store.get(&peer, "t"), Some(0));
    }

    #[test]
    fn weight_sums_tags() {
        let store = TagStore::default();
        let peer = PeerId::random();
        store.update(&peer, "a", TagUpdate::Seed(30));
        store.update(&peer, "b", TagUpdate::Seed(40));
        assert_eq!(store.weight(&peer), 70);
        assert_eq!(store.weight(&PeerId::random()), 0);
    }

    #[test]
    fn removed_peers_lose_every_tag() {
        let store = TagStore::default();
        let (gone, kept) = (PeerId::random(), PeerId::random());
        store.update(&gone, "a", TagUpdate::Seed(30));
        store.update(&gone, "b", TagUpdate::Seed(40));
        store.update(&kept, "a", TagUpdate::Seed(10));
        assert_eq!(store.len(), 2);

        assert!(store.remove(&gone));
        assert!(!store.remove(&gone));
        assert_eq!(store.get(&gone, "a"), None);
        assert_eq!(store.weight(&gone), 0);
        assert_eq!(store.get(&kept, "a"), Some(10));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn peer_stream_passes_bytes() {
        let (a, b) = tokio::io::duplex(64);
        let peer = PeerId::random();
        let mut left = PeerStream::new(peer, "/tuns/test/1.0.0", a);
        let mut right = PeerStream::new(peer, "/tuns/test/1.0.0", b);
        left.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test(start_paused = true)]
    async fn read_deadline_times_out() {
        let (a, _b) = tokio::io::duplex(64);
        let mut stream = PeerStream::new(PeerId::random(), "/tuns/test/1.0.0", a);
        stream.set_read_deadline(Some(Instant::now() + Duration::from_secs(1)));
        let mut buf = [0u8; 1];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
