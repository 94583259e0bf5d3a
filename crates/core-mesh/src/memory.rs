//! In-process substrate for tests and local simulations.
//!
//! A [`MemoryNetwork`] is a hub that any number of [`MemoryNode`]s join.
//! Streams are `tokio::io::duplex` pipes, topics fan out to every online
//! subscriber, and the DHT is one shared provider table. Connections are
//! explicit: a node only reaches peers it connected to, so tests control the
//! topology with [`MemoryNetwork::disconnect`] and [`MemoryNetwork::set_online`].

use async_trait::async_trait;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::events::{EventBus, EventSubscription, MeshEvent};
use crate::substrate::{
    InboundStreams, PeerDescriptor, PeerStream, ProviderStream, Substrate, SubstrateError,
    TagStore, TagUpdate, TopicMessage, TopicSubscription,
};

const PIPE_CAPACITY: usize = 64 * 1024;
const QUEUE_DEPTH: usize = 64;

struct NodeSlot {
    addr: Multiaddr,
    online: bool,
    handlers: HashMap<&'static str, mpsc::Sender<PeerStream>>,
    topics: HashMap<String, Vec<mpsc::Sender<TopicMessage>>>,
    events: EventBus,
}

impl NodeSlot {
    fn protocols(&self) -> Vec<String> {
        let mut protocols: Vec<String> = self
            .handlers
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(p, _)| p.to_string())
            .collect();
        protocols.push("/ipfs/id/1.0.0".to_string());
        protocols.sort();
        protocols
    }
}

#[derive(Default)]
struct Hub {
    nodes: HashMap<PeerId, NodeSlot>,
    links: HashSet<(PeerId, PeerId)>,
    providers: HashMap<Vec<u8>, BTreeSet<PeerId>>,
    next_port: u64,
}

fn link(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl Hub {
    fn linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.links.contains(&link(*a, *b))
    }

    fn online(&self, peer: &PeerId) -> bool {
        self.nodes.get(peer).map(|n| n.online).unwrap_or(false)
    }

    fn unlink(&mut self, a: PeerId, b: PeerId) -> bool {
        if !self.links.remove(&link(a, b)) {
            return false;
        }
        for (me, other) in [(a, b), (b, a)] {
            if let Some(node) = self.nodes.get(&me) {
                node.events.publish(MeshEvent::PeerDisconnected(other));
            }
        }
        true
    }
}

/// Shared hub every [`MemoryNode`] of one simulated network hangs off.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_node(&self) -> Arc<MemoryNode> {
        self.add_node_with_id(PeerId::random())
    }

    pub fn add_node_with_id(&self, peer: PeerId) -> Arc<MemoryNode> {
        let events = EventBus::default();
        let addr = {
            let mut hub = self.hub();
            hub.next_port += 1;
            let addr = Multiaddr::empty().with(Protocol::Memory(hub.next_port));
            hub.nodes.insert(
                peer,
                NodeSlot {
                    addr: addr.clone(),
                    online: true,
                    handlers: HashMap::new(),
                    topics: HashMap::new(),
                    events: events.clone(),
                },
            );
            addr
        };
        Arc::new(MemoryNode {
            id: peer,
            addr,
            network: self.clone(),
            tags: TagStore::default(),
            book: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Takes a node off the network; its connections drop.
    pub fn set_online(&self, peer: &PeerId, online: bool) {
        let mut hub = self.hub();
        if let Some(node) = hub.nodes.get_mut(peer) {
            node.online = online;
        }
        if !online {
            let links: Vec<(PeerId, PeerId)> = hub
                .links
                .iter()
                .filter(|(a, b)| a == peer || b == peer)
                .copied()
                .collect();
            for (a, b) in links {
                hub.unlink(a, b);
            }
        }
    }

    pub fn disconnect(&self, a: &PeerId, b: &PeerId) -> bool {
        self.hub().unlink(*a, *b)
    }

    pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.hub().linked(a, b)
    }
}

/// One node's view of a [`MemoryNetwork`].
pub struct MemoryNode {
    id: PeerId,
    addr: Multiaddr,
    network: MemoryNetwork,
    tags: TagStore,
    book: Mutex<HashMap<PeerId, Vec<Multiaddr>>>,
    events: EventBus,
}

impl MemoryNode {
    pub fn addr(&self) -> Multiaddr {
        self.addr.clone()
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    fn book(&self) -> MutexGuard<'_, HashMap<PeerId, Vec<Multiaddr>>> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remember(&self, peer: PeerId, addrs: Vec<Multiaddr>) {
        let mut book = self.book();
        let known = book.entry(peer).or_default();
        for addr in addrs {
            if !known.contains(&addr) {
                known.push(addr);
            }
        }
    }
}

#[async_trait]
impl Substrate for MemoryNode {
    fn local_peer_id(&self) -> PeerId {
        self.id
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        vec![self.addr.clone()]
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        let hub = self.network.hub();
        hub.links
            .iter()
            .filter_map(|(a, b)| {
                if *a == self.id {
                    Some(*b)
                } else if *b == self.id {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect()
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.network.hub().linked(&self.id, peer)
    }

    fn addresses_of(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.book().get(peer).cloned().unwrap_or_default()
    }

    fn known_peers(&self) -> Vec<PeerId> {
        self.book().keys().copied().collect()
    }

    fn add_addresses(&self, peer: PeerId, addrs: Vec<Multiaddr>, _ttl: Duration) {
        if peer != self.id {
            self.remember(peer, addrs);
        }
    }

    fn protocols_of(&self, peer: &PeerId) -> Vec<String> {
        let hub = self.network.hub();
        if !hub.linked(&self.id, peer) {
            return Vec::new();
        }
        hub.nodes.get(peer).map(NodeSlot::protocols).unwrap_or_default()
    }

    fn update_tag(&self, peer: &PeerId, tag: &str, update: TagUpdate) -> i32 {
        self.tags.update(peer, tag, update)
    }

    fn tag(&self, peer: &PeerId, tag: &str) -> Option<i32> {
        self.tags.get(peer, tag)
    }

    fn clear_tags(&self, peer: &PeerId) {
        self.tags.remove(peer);
    }

    fn subscribe_events(&self) -> EventSubscription {
        self.events.subscribe()
    }

    fn accept(&self, protocol: &'static str) -> Result<InboundStreams, SubstrateError> {
        let mut hub = self.network.hub();
        let node = hub.nodes.get_mut(&self.id).ok_or(SubstrateError::Shutdown)?;
        if let Some(existing) = node.handlers.get(protocol) {
            if !existing.is_closed() {
                return Err(SubstrateError::AlreadyRegistered(protocol));
            }
        }
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        node.handlers.insert(protocol, tx);
        Ok(rx)
    }

    async fn join_topic(&self, topic: &str) -> Result<TopicSubscription, SubstrateError> {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let mut hub = self.network.hub();
        let node = hub.nodes.get_mut(&self.id).ok_or(SubstrateError::Shutdown)?;
        node.topics.entry(topic.to_string()).or_default().push(tx);
        Ok(TopicSubscription::new(topic, rx))
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), SubstrateError> {
        let hub = self.network.hub();
        if !hub.online(&self.id) {
            return Err(SubstrateError::Shutdown);
        }
        for (peer, node) in hub.nodes.iter() {
            if *peer == self.id || !node.online {
                continue;
            }
            for tx in node.topics.get(topic).into_iter().flatten() {
                let _ = tx.try_send(TopicMessage {
                    source: Some(self.id),
                    data: data.clone(),
                });
            }
        }
        Ok(())
    }

    async fn connect(&self, peer: PeerId, _addrs: Vec<Multiaddr>) -> Result<(), SubstrateError> {
        if peer == self.id {
            return Err(SubstrateError::Dial {
                peer,
                reason: "cannot dial self".to_string(),
            });
        }
        let (remote_addr, identified) = {
            let mut hub = self.network.hub();
            if !hub.online(&self.id) {
                return Err(SubstrateError::Shutdown);
            }
            let remote_addr = match hub.nodes.get(&peer) {
                Some(node) if node.online => node.addr.clone(),
                _ => {
                    return Err(SubstrateError::Dial {
                        peer,
                        reason: "peer unreachable".to_string(),
                    })
                }
            };
            if hub.linked(&self.id, &peer) {
                (remote_addr, None)
            } else {
                hub.links.insert(link(self.id, peer));
                let mine = hub.nodes.get(&self.id).map(NodeSlot::protocols).unwrap_or_default();
                let theirs = hub.nodes.get(&peer).map(NodeSlot::protocols).unwrap_or_default();
                if let Some(node) = hub.nodes.get(&peer) {
                    node.events.publish(MeshEvent::PeerConnected(self.id));
                    node.events.publish(MeshEvent::PeerIdentified {
                        peer: self.id,
                        protocols: mine,
                    });
                }
                (remote_addr, Some(theirs))
            }
        };
        self.remember(peer, vec![remote_addr]);
        if let Some(protocols) = identified {
            self.events.publish(MeshEvent::PeerConnected(peer));
            self.events.publish(MeshEvent::PeerIdentified { peer, protocols });
        }
        Ok(())
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: &'static str,
    ) -> Result<PeerStream, SubstrateError> {
        let (handler, remote_addr) = {
            let hub = self.network.hub();
            if !hub.linked(&self.id, &peer) {
                return Err(SubstrateError::NotConnected(peer));
            }
            let node = hub.nodes.get(&peer).ok_or(SubstrateError::NotConnected(peer))?;
            let handler = node.handlers.get(protocol).cloned().ok_or_else(|| {
                SubstrateError::Stream {
                    peer,
                    protocol,
                    reason: "protocol not supported".to_string(),
                }
            })?;
            (handler, node.addr.clone())
        };
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let inbound = PeerStream::new(self.id, protocol, remote)
            .with_addrs(Some(remote_addr.clone()), Some(self.addr.clone()));
        handler
            .send(inbound)
            .await
            .map_err(|_| SubstrateError::Stream {
                peer,
                protocol,
                reason: "handler closed".to_string(),
            })?;
        Ok(PeerStream::new(peer, protocol, local).with_addrs(Some(self.addr.clone()), Some(remote_addr)))
    }

    async fn provide(&self, key: Vec<u8>) -> Result<(), SubstrateError> {
        let mut hub = self.network.hub();
        if !hub.online(&self.id) {
            return Err(SubstrateError::Shutdown);
        }
        hub.providers.entry(key).or_default().insert(self.id);
        Ok(())
    }

    async fn find_providers(
        &self,
        key: Vec<u8>,
        limit: usize,
    ) -> Result<ProviderStream, SubstrateError> {
        let found: Vec<PeerDescriptor> = {
            let hub = self.network.hub();
            hub.providers
                .get(&key)
                .into_iter()
                .flatten()
                .filter_map(|peer| {
                    let node = hub.nodes.get(peer)?;
                    node.online.then(|| PeerDescriptor {
                        peer_id: *peer,
                        addrs: vec![node.addr.clone()],
                    })
                })
                .take(limit)
                .collect()
        };
        let (tx, rx) = mpsc::channel(found.len().max(1));
        for descriptor in found {
            let _ = tx.try_send(descriptor);
        }
        Ok(rx)
    }

    async fn find_peer(&self, peer: PeerId) -> Result<Vec<Multiaddr>, SubstrateError> {
        let hub = self.network.hub();
        match hub.nodes.get(&peer) {
            Some(node) if node.online => Ok(vec![node.addr.clone()]),
            _ => Err(SubstrateError::Dht(format!("peer {peer} not found"))),
        }
    }

    async fn bootstrap(&self) -> Result<(), SubstrateError> {
        let hub = self.network.hub();
        if hub.nodes.iter().any(|(p, n)| *p != self.id && n.online) {
            Ok(())
        } else {
            Err(SubstrateError::Dht("no known peers".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn connect_links_both_sides_and_emits_events() {
        let net = MemoryNetwork::new();
        let a = net.add_node();
        let b = net.add_node();
        let _handler = b.accept("/tuns/x/1.0.0").unwrap();
        let mut events = a.subscribe_events();

        a.connect(b.local_peer_id(), vec![]).await.unwrap();

        assert!(a.is_connected(&b.local_peer_id()));
        assert!(b.is_connected(&a.local_peer_id()));
        assert_eq!(a.addresses_of(&b.local_peer_id()), vec![b.addr()]);
        assert_eq!(
            events.next().await,
            Some(MeshEvent::PeerConnected(b.local_peer_id()))
        );
        match events.next().await {
            Some(MeshEvent::PeerIdentified { peer, protocols }) => {
                assert_eq!(peer, b.local_peer_id());
                assert!(protocols.contains(&"/tuns/x/1.0.0".to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn streams_reach_the_registered_handler() {
        let net = MemoryNetwork::new();
        let a = net.add_node();
        let b = net.add_node();
        let mut inbound = b.accept("/tuns/echo/1.0.0").unwrap();
        a.connect(b.local_peer_id(), vec![]).await.unwrap();

        let mut out = a.open_stream(b.local_peer_id(), "/tuns/echo/1.0.0").await.unwrap();
        out.write_all(b"hi").await.unwrap();
        let mut incoming = inbound.recv().await.unwrap();
        assert_eq!(incoming.peer(), a.local_peer_id());
        let mut buf = [0u8; 2];
        incoming.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn unsupported_or_unconnected_streams_fail() {
        let net = MemoryNetwork::new();
        let a = net.add_node();
        let b = net.add_node();
        assert!(matches!(
            a.open_stream(b.local_peer_id(), "/tuns/x/1.0.0").await,
            Err(SubstrateError::NotConnected(_))
        ));
        a.connect(b.local_peer_id(), vec![]).await.unwrap();
        assert!(matches!(
            a.open_stream(b.local_peer_id(), "/tuns/x/1.0.0").await,
            Err(SubstrateError::Stream { .. })
        ));
    }

    #[tokio::test]
    async fn double_registration_is_rejected() {
        let net = MemoryNetwork::new();
        let a = net.add_node();
        let _first = a.accept("/tuns/x/1.0.0").unwrap();
        assert!(matches!(
            a.accept("/tuns/x/1.0.0"),
            Err(SubstrateError::AlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn offline_nodes_drop_links_and_cannot_be_dialed() {
        let net = MemoryNetwork::new();
        let a = net.add_node();
        let b = net.add_node();
        a.connect(b.local_peer_id(), vec![]).await.unwrap();
        net.set_online(&b.local_peer_id(), false);
        assert!(!a.is_connected(&b.local_peer_id()));
        assert!(a.connect(b.local_peer_id(), vec![]).await.is_err());
        assert!(a.find_peer(b.local_peer_id()).await.is_err());
    }

    #[tokio::test]
    async fn topics_skip_the_author() {
        let net = MemoryNetwork::new();
        let a = net.add_node();
        let b = net.add_node();
        let mut mine = a.join_topic("t").await.unwrap();
        let mut theirs = b.join_topic("t").await.unwrap();
        a.publish("t", b"x".to_vec()).await.unwrap();
        let msg = theirs.next().await.unwrap();
        assert_eq!(msg.source, Some(a.local_peer_id()));
        assert_eq!(msg.data, b"x");
        assert!(tokio::time::timeout(Duration::from_millis(20), mine.next())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn providers_are_found() {
        let net = MemoryNetwork::new();
        let a = net.add_node();
        let b = net.add_node();
        b.provide(b"key".to_vec()).await.unwrap();
        let mut found = a.find_providers(b"key".to_vec(), 10).await.unwrap();
        let descriptor = found.recv().await.unwrap();
        assert_eq!(descriptor.peer_id, b.local_peer_id());
        assert_eq!(descriptor.addrs, vec![b.addr()]);
        assert!(found.recv().await.is_none());
    }
}
