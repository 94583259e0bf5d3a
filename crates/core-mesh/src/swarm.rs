//! [`Substrate`] over a libp2p swarm.
//!
//! One driver task owns the `Swarm`. Everything else talks to it through a
//! command channel with oneshot replies, or reads the shared peer book the
//! driver keeps up to date from swarm events. Streams bypass the driver
//! entirely: `libp2p-stream` hands out a cloneable control for opening and
//! accepting them.
//!
//! ```no_run
//! # use core_mesh::{config::MeshConfig, swarm::SwarmSubstrate};
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let keypair = libp2p::identity::Keypair::generate_ed25519();
//! let substrate = SwarmSubstrate::spawn(keypair, &MeshConfig::default())?;
//! println!("running as {}", substrate.peer_id());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    gossipsub::{self, IdentTopic, MessageAuthenticity, TopicHash, ValidationMode},
    identify, identity, kad, noise, ping,
    swarm::{
        dial_opts::{DialOpts, PeerCondition},
        NetworkBehaviour, SwarmEvent,
    },
    tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;

use crate::config::{ConnectionConfig, MeshConfig};
use crate::events::{EventBus, EventSubscription, MeshEvent};
use crate::substrate::{
    InboundStreams, PeerDescriptor, PeerStream, ProviderStream, Substrate, SubstrateError,
    TagStore, TagUpdate, TopicMessage, TopicSubscription,
};

const COMMAND_QUEUE: usize = 256;
const INBOUND_QUEUE: usize = 64;
const TOPIC_QUEUE: usize = 256;

type Reply<T> = oneshot::Sender<Result<T, SubstrateError>>;

fn setup_error(e: impl std::fmt::Display) -> SubstrateError {
    SubstrateError::Setup(e.to_string())
}

#[derive(NetworkBehaviour)]
struct MeshBehaviour {
    kademlia: kad::Behaviour<kad::store::MemoryStore>,
    gossipsub: gossipsub::Behaviour,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
    stream: libp2p_stream::Behaviour,
}

impl MeshBehaviour {
    fn new(
        key: &identity::Keypair,
        version: &str,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let peer_id = key.public().to_peer_id();

        let mut kademlia = kad::Behaviour::new(peer_id, kad::store::MemoryStore::new(peer_id));
        kademlia.set_mode(Some(kad::Mode::Server));

        let gossip_config = gossipsub::ConfigBuilder::default()
            .validation_mode(ValidationMode::Strict)
            .heartbeat_interval(Duration::from_secs(1))
            .build()
            .map_err(|e| e.to_string())?;
        let gossipsub =
            gossipsub::Behaviour::new(MessageAuthenticity::Signed(key.clone()), gossip_config)?;

        let identify = identify::Behaviour::new(
            identify::Config::new(format!("tuns/{}", version), key.public())
                .with_agent_version(format!("tuns-node/{}", version)),
        );

        Ok(Self {
            kademlia,
            gossipsub,
            identify,
            ping: ping::Behaviour::new(ping::Config::new()),
            stream: libp2p_stream::Behaviour::new(),
        })
    }
}

#[derive(Debug)]
struct Connection {
    established: u32,
    since: Instant,
    remote: Multiaddr,
}

/// What the driver knows about other peers, shared with readers.
#[derive(Debug, Default)]
struct PeerBook {
    connections: HashMap<PeerId, Connection>,
    /// Address to expiry; `None` never expires.
    addresses: HashMap<PeerId, HashMap<Multiaddr, Option<Instant>>>,
    protocols: HashMap<PeerId, Vec<String>>,
    listen: Vec<Multiaddr>,
}

impl PeerBook {
    fn add_address(&mut self, peer: PeerId, addr: Multiaddr, expiry: Option<Instant>) {
        let entry = self.addresses.entry(peer).or_default();
        match entry.get(&addr) {
            // never shorten a permanent or longer-lived entry
            Some(None) => {}
            Some(Some(current)) if expiry.map_or(false, |e| e <= *current) => {}
            _ => {
                entry.insert(addr, expiry);
            }
        }
    }

    fn addresses_of(&self, peer: &PeerId, now: Instant) -> Vec<Multiaddr> {
        self.addresses
            .get(peer)
            .map(|addrs| {
                addrs
                    .iter()
                    .filter(|(_, expiry)| expiry.map_or(true, |e| e > now))
                    .map(|(addr, _)| addr.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn prune_addresses(&mut self, now: Instant) {
        for addrs in self.addresses.values_mut() {
            addrs.retain(|_, expiry| expiry.map_or(true, |e| e > now));
        }
        self.addresses.retain(|_, addrs| !addrs.is_empty());
    }
}

/// Peers to disconnect so the connection count drops to the low watermark.
///
/// Connections younger than the grace period are left alone; the rest go
/// lowest weight first.
fn trim_victims(
    connections: &[(PeerId, Instant, i32)],
    now: Instant,
    config: &ConnectionConfig,
) -> Vec<PeerId> {
    if connections.len() <= config.high_watermark {
        return Vec::new();
    }
    let excess = connections.len().saturating_sub(config.low_watermark);
    let grace = Duration::from_secs(config.grace_secs);
    let mut eligible: Vec<&(PeerId, Instant, i32)> = connections
        .iter()
        .filter(|(_, since, _)| now.saturating_duration_since(*since) >= grace)
        .collect();
    eligible.sort_by_key(|(peer, _, weight)| (*weight, *peer));
    eligible
        .into_iter()
        .take(excess)
        .map(|(peer, _, _)| *peer)
        .collect()
}

enum Command {
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: Reply<()>,
    },
    Subscribe {
        topic: String,
        sink: mpsc::Sender<TopicMessage>,
        reply: Reply<()>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: Reply<()>,
    },
    Provide {
        key: Vec<u8>,
        reply: Reply<()>,
    },
    FindProviders {
        key: Vec<u8>,
        limit: usize,
        sink: mpsc::Sender<PeerDescriptor>,
    },
    FindPeer {
        peer: PeerId,
        reply: Reply<Vec<Multiaddr>>,
    },
    Bootstrap {
        reply: Reply<()>,
    },
}

struct ProviderLookup {
    sink: mpsc::Sender<PeerDescriptor>,
    limit: usize,
    seen: HashSet<PeerId>,
}

struct Driver {
    swarm: Swarm<MeshBehaviour>,
    commands: mpsc::Receiver<Command>,
    book: Arc<Mutex<PeerBook>>,
    tags: Arc<TagStore>,
    events: EventBus,
    connections: ConnectionConfig,
    shutdown: CancellationToken,
    pending_dials: HashMap<PeerId, Vec<Reply<()>>>,
    pending_provides: HashMap<kad::QueryId, Reply<()>>,
    pending_bootstraps: HashMap<kad::QueryId, Reply<()>>,
    peer_lookups: HashMap<kad::QueryId, (PeerId, Reply<Vec<Multiaddr>>)>,
    provider_lookups: HashMap<kad::QueryId, ProviderLookup>,
    topics: HashMap<TopicHash, Vec<mpsc::Sender<TopicMessage>>>,
}

fn lock_book(book: &Mutex<PeerBook>) -> MutexGuard<'_, PeerBook> {
    book.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Driver {
    fn book(&self) -> MutexGuard<'_, PeerBook> {
        lock_book(&self.book)
    }

    async fn run(mut self) {
        let mut trim = tokio::time::interval(Duration::from_secs(
            self.connections.trim_interval_secs.max(1),
        ));
        trim.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = self.swarm.select_next_some() => self.handle_event(event),
                _ = trim.tick() => self.trim_connections(),
            }
        }
        log::info!("swarm: driver stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial { peer, addrs, reply } => self.dial(peer, addrs, reply),
            Command::Subscribe { topic, sink, reply } => {
                let topic = IdentTopic::new(topic);
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .subscribe(&topic)
                    .map(|_| ())
                    .map_err(|e| SubstrateError::Topic(e.to_string()));
                if result.is_ok() {
                    self.topics.entry(topic.hash()).or_default().push(sink);
                }
                let _ = reply.send(result);
            }
            Command::Publish { topic, data, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(IdentTopic::new(topic), data)
                    .map(|_| ())
                    .map_err(|e| SubstrateError::Topic(e.to_string()));
                let _ = reply.send(result);
            }
            Command::Provide { key, reply } => {
                match self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .start_providing(kad::RecordKey::new(&key))
                {
                    Ok(id) => {
                        self.pending_provides.insert(id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(SubstrateError::Dht(e.to_string())));
                    }
                }
            }
            Command::FindProviders { key, limit, sink } => {
                let id = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .get_providers(kad::RecordKey::new(&key));
                self.provider_lookups.insert(
                    id,
                    ProviderLookup {
                        sink,
                        limit: limit.max(1),
                        seen: HashSet::new(),
                    },
                );
            }
            Command::FindPeer { peer, reply } => {
                let id = self.swarm.behaviour_mut().kademlia.get_closest_peers(peer);
                self.peer_lookups.insert(id, (peer, reply));
            }
            Command::Bootstrap { reply } => match self.swarm.behaviour_mut().kademlia.bootstrap() {
                Ok(id) => {
                    self.pending_bootstraps.insert(id, reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(SubstrateError::Dht(e.to_string())));
                }
            },
        }
    }

    fn dial(&mut self, peer: PeerId, addrs: Vec<Multiaddr>, reply: Reply<()>) {
        if self.swarm.is_connected(&peer) {
            let _ = reply.send(Ok(()));
            return;
        }
        let mut known = self.book().addresses_of(&peer, Instant::now());
        for addr in addrs {
            if !known.contains(&addr) {
                known.push(addr);
            }
        }
        let opts = DialOpts::peer_id(peer)
            .addresses(known)
            .condition(PeerCondition::DisconnectedAndNotDialing)
            .build();
        match self.swarm.dial(opts) {
            Ok(()) => self.pending_dials.entry(peer).or_default().push(reply),
            // a dial is already in flight; wait for its outcome
            Err(libp2p::swarm::DialError::DialPeerConditionFalse(_)) => {
                self.pending_dials.entry(peer).or_default().push(reply)
            }
            Err(e) => {
                let _ = reply.send(Err(SubstrateError::Dial {
                    peer,
                    reason: e.to_string(),
                }));
            }
        }
    }

    fn finish_dials(&mut self, peer: &PeerId, outcome: Result<(), String>) {
        for reply in self.pending_dials.remove(peer).unwrap_or_default() {
            let result = outcome.clone().map_err(|reason| SubstrateError::Dial {
                peer: *peer,
                reason,
            });
            let _ = reply.send(result);
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<MeshBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                log::info!("swarm: listening on {}", address);
                self.book().listen.push(address);
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.book().listen.retain(|a| *a != address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                endpoint,
                num_established,
                ..
            } => {
                let remote = endpoint.get_remote_address().clone();
                if endpoint.is_dialer() {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, remote.clone());
                }
                let first = {
                    let mut book = self.book();
                    if endpoint.is_dialer() {
                        book.add_address(peer_id, remote.clone(), None);
                    }
                    let conn = book.connections.entry(peer_id).or_insert(Connection {
                        established: 0,
                        since: Instant::now(),
                        remote,
                    });
                    conn.established = num_established.get();
                    num_established.get() == 1
                };
                if first {
                    log::debug!("swarm: connected to {}", peer_id);
                    self.events.publish(MeshEvent::PeerConnected(peer_id));
                }
                self.finish_dials(&peer_id, Ok(()));
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                let gone = {
                    let mut book = self.book();
                    if num_established == 0 {
                        book.connections.remove(&peer_id);
                        true
                    } else {
                        if let Some(conn) = book.connections.get_mut(&peer_id) {
                            conn.established = num_established;
                        }
                        false
                    }
                };
                if gone {
                    log::debug!("swarm: disconnected from {}", peer_id);
                    self.events.publish(MeshEvent::PeerDisconnected(peer_id));
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer),
                error,
                ..
            } => {
                if !self.swarm.is_connected(&peer) {
                    self.finish_dials(&peer, Err(error.to_string()));
                }
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour(event),
            _ => {}
        }
    }

    fn handle_behaviour(&mut self, event: MeshBehaviourEvent) {
        match event {
            MeshBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                let protocols: Vec<String> =
                    info.protocols.iter().map(|p| p.to_string()).collect();
                {
                    let mut book = self.book();
                    for addr in &info.listen_addrs {
                        book.add_address(peer_id, addr.clone(), None);
                    }
                    book.protocols.insert(peer_id, protocols.clone());
                }
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr);
                }
                self.events.publish(MeshEvent::PeerIdentified {
                    peer: peer_id,
                    protocols,
                });
            }
            MeshBehaviourEvent::Gossipsub(gossipsub::Event::Message { message, .. }) => {
                if let Some(sinks) = self.topics.get_mut(&message.topic) {
                    sinks.retain(|sink| !sink.is_closed());
                    for sink in sinks.iter() {
                        let delivered = sink.try_send(TopicMessage {
                            source: message.source,
                            data: message.data.clone(),
                        });
                        if delivered.is_err() {
                            log::debug!("swarm: topic queue full, dropping message");
                        }
                    }
                }
            }
            MeshBehaviourEvent::Kademlia(kad::Event::RoutingUpdated {
                peer, addresses, ..
            }) => {
                let mut book = self.book();
                for addr in addresses.iter() {
                    book.add_address(peer, addr.clone(), None);
                }
            }
            MeshBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                id,
                result,
                step,
                ..
            }) => self.handle_query(id, result, step.last),
            _ => {}
        }
    }

    fn handle_query(&mut self, id: kad::QueryId, result: kad::QueryResult, last: bool) {
        match result {
            kad::QueryResult::StartProviding(result) => {
                if let Some(reply) = self.pending_provides.remove(&id) {
                    let _ = reply.send(
                        result
                            .map(|_| ())
                            .map_err(|e| SubstrateError::Dht(e.to_string())),
                    );
                }
            }
            kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                providers,
                ..
            })) => {
                let Some(mut lookup) = self.provider_lookups.remove(&id) else {
                    return;
                };
                let now = Instant::now();
                for provider in providers {
                    if lookup.seen.len() >= lookup.limit || !lookup.seen.insert(provider) {
                        continue;
                    }
                    let addrs = self.book().addresses_of(&provider, now);
                    let _ = lookup.sink.try_send(PeerDescriptor {
                        peer_id: provider,
                        addrs,
                    });
                }
                if lookup.seen.len() >= lookup.limit || lookup.sink.is_closed() {
                    if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
                        query.finish();
                    }
                } else if !last {
                    self.provider_lookups.insert(id, lookup);
                }
            }
            kad::QueryResult::GetProviders(result) => {
                if let Err(e) = result {
                    log::debug!("swarm: provider lookup failed: {}", e);
                }
                if last {
                    self.provider_lookups.remove(&id);
                }
            }
            kad::QueryResult::GetClosestPeers(_) => {
                if let Some((peer, reply)) = self.peer_lookups.remove(&id) {
                    let addrs = self.book().addresses_of(&peer, Instant::now());
                    let result = if addrs.is_empty() {
                        Err(SubstrateError::NoAddresses(peer))
                    } else {
                        Ok(addrs)
                    };
                    let _ = reply.send(result);
                }
            }
            kad::QueryResult::Bootstrap(result) => {
                if let Err(e) = &result {
                    log::debug!("swarm: bootstrap step failed: {}", e);
                }
                if last {
                    if let Some(reply) = self.pending_bootstraps.remove(&id) {
                        let _ = reply.send(
                            result
                                .map(|_| ())
                                .map_err(|e| SubstrateError::Dht(e.to_string())),
                        );
                    }
                }
            }
            _ => {}
        }
    }

    fn trim_connections(&mut self) {
        let now = Instant::now();
        let victims = {
            let mut book = self.book();
            book.prune_addresses(now);
            let connections: Vec<(PeerId, Instant, i32)> = book
                .connections
                .iter()
                .map(|(peer, conn)| (*peer, conn.since, self.tags.weight(peer)))
                .collect();
            trim_victims(&connections, now, &self.connections)
        };
        if victims.is_empty() {
            return;
        }
        log::info!("swarm: trimming {} connections", victims.len());
        for peer in victims {
            let _ = self.swarm.disconnect_peer_id(peer);
        }
    }
}

pub struct SwarmSubstrate {
    peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    control: libp2p_stream::Control,
    book: Arc<Mutex<PeerBook>>,
    tags: Arc<TagStore>,
    events: EventBus,
    shutdown: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SwarmSubstrate {
    /// Builds the swarm, starts listening and spawns its driver task.
    pub fn spawn(
        keypair: identity::Keypair,
        config: &MeshConfig,
    ) -> Result<Arc<Self>, SubstrateError> {
        let peer_id = keypair.public().to_peer_id();
        let version = config.version.clone();
        let idle = Duration::from_secs(config.connections.idle_timeout_secs);

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(setup_error)?
            .with_dns()
            .map_err(setup_error)?
            .with_behaviour(|key| MeshBehaviour::new(key, &version))
            .map_err(setup_error)?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(idle))
            .build();

        for raw in &config.listen_addrs {
            let addr: Multiaddr = raw.parse().map_err(setup_error)?;
            swarm.listen_on(addr).map_err(setup_error)?;
        }

        let control = swarm.behaviour().stream.new_control();
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let book = Arc::new(Mutex::new(PeerBook::default()));
        let tags = Arc::new(TagStore::default());
        let events = EventBus::default();
        let shutdown = CancellationToken::new();

        let driver = Driver {
            swarm,
            commands: rx,
            book: Arc::clone(&book),
            tags: Arc::clone(&tags),
            events: events.clone(),
            connections: config.connections.clone(),
            shutdown: shutdown.clone(),
            pending_dials: HashMap::new(),
            pending_provides: HashMap::new(),
            pending_bootstraps: HashMap::new(),
            peer_lookups: HashMap::new(),
            provider_lookups: HashMap::new(),
            topics: HashMap::new(),
        };
        let handle = tokio::spawn(driver.run());
        log::info!("swarm: started as {}", peer_id);

        Ok(Arc::new(Self {
            peer_id,
            commands: tx,
            control,
            book,
            tags,
            events,
            shutdown,
            driver: Mutex::new(Some(handle)),
        }))
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn book(&self) -> MutexGuard<'_, PeerBook> {
        lock_book(&self.book)
    }

    /// Stops the driver; every connection closes with it.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SubstrateError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SubstrateError::Shutdown)?;
        rx.await.map_err(|_| SubstrateError::Shutdown)?
    }

    fn stream_addrs(&self, peer: &PeerId) -> (Option<Multiaddr>, Option<Multiaddr>) {
        let book = self.book();
        (
            book.listen.first().cloned(),
            book.connections.get(peer).map(|c| c.remote.clone()),
        )
    }
}

#[async_trait]
impl Substrate for SwarmSubstrate {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.book().listen.clone()
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.book().connections.keys().copied().collect()
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.book().connections.contains_key(peer)
    }

    fn addresses_of(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.book().addresses_of(peer, Instant::now())
    }

    fn known_peers(&self) -> Vec<PeerId> {
        let now = Instant::now();
        let book = self.book();
        book.addresses
            .keys()
            .filter(|peer| !book.addresses_of(peer, now).is_empty())
            .copied()
            .collect()
    }

    fn add_addresses(&self, peer: PeerId, addrs: Vec<Multiaddr>, ttl: Duration) {
        if peer == self.peer_id {
            return;
        }
        let expiry = Instant::now() + ttl;
        let mut book = self.book();
        for addr in addrs {
            book.add_address(peer, addr, Some(expiry));
        }
    }

    fn protocols_of(&self, peer: &PeerId) -> Vec<String> {
        self.book().protocols.get(peer).cloned().unwrap_or_default()
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
        let mut incoming = self
            .control
            .clone()
            .accept(StreamProtocol::new(protocol))
            .map_err(|_| SubstrateError::AlreadyRegistered(protocol))?;
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let book = Arc::clone(&self.book);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let (peer, stream) = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = incoming.next() => match next {
                        Some(next) => next,
                        None => break,
                    },
                };
                let (local, remote) = {
                    let book = lock_book(&book);
                    (
                        book.listen.first().cloned(),
                        book.connections.get(&peer).map(|c| c.remote.clone()),
                    )
                };
                let stream =
                    PeerStream::new(peer, protocol, stream.compat()).with_addrs(local, remote);
                if tx.send(stream).await.is_err() {
                    break;
                }
            }
            log::debug!("swarm: stopped accepting {}", protocol);
        });
        Ok(rx)
    }

    async fn join_topic(&self, topic: &str) -> Result<TopicSubscription, SubstrateError> {
        let (sink, rx) = mpsc::channel(TOPIC_QUEUE);
        let name = topic.to_string();
        self.request(|reply| Command::Subscribe {
            topic: name,
            sink,
            reply,
        })
        .await?;
        Ok(TopicSubscription::new(topic, rx))
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), SubstrateError> {
        let topic = topic.to_string();
        self.request(|reply| Command::Publish { topic, data, reply })
            .await
    }

    async fn connect(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<(), SubstrateError> {
        if peer == self.peer_id {
            return Err(SubstrateError::Dial {
                peer,
                reason: "cannot dial self".to_string(),
            });
        }
        self.request(|reply| Command::Dial { peer, addrs, reply })
            .await
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: &'static str,
    ) -> Result<PeerStream, SubstrateError> {
        let stream = self
            .control
            .clone()
            .open_stream(peer, StreamProtocol::new(protocol))
            .await
            .map_err(|e| SubstrateError::Stream {
                peer,
                protocol,
                reason: e.to_string(),
            })?;
        let (local, remote) = self.stream_addrs(&peer);
        Ok(PeerStream::new(peer, protocol, stream.compat()).with_addrs(local, remote))
    }

    async fn provide(&self, key: Vec<u8>) -> Result<(), SubstrateError> {
        self.request(|reply| Command::Provide { key, reply }).await
    }

    async fn find_providers(
        &self,
        key: Vec<u8>,
        limit: usize,
    ) -> Result<ProviderStream, SubstrateError> {
        let (sink, rx) = mpsc::channel(limit.max(1));
        self.commands
            .send(Command::FindProviders { key, limit, sink })
            .await
            .map_err(|_| SubstrateError::Shutdown)?;
        Ok(rx)
    }

    async fn find_peer(&self, peer: PeerId) -> Result<Vec<Multiaddr>, SubstrateError> {
        let known = self.addresses_of(&peer);
        if self.is_connected(&peer) && !known.is_empty() {
            return Ok(known);
        }
        self.request(|reply| Command::FindPeer { peer, reply }).await
    }

    async fn bootstrap(&self) -> Result<(), SubstrateError> {
        self.request(|reply| Command::Bootstrap { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(low: usize, high: usize) -> ConnectionConfig {
        ConnectionConfig {
            low_watermark: low,
            high_watermark: high,
            grace_secs: 60,
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn nothing_trimmed_under_the_high_watermark() {
        let now = Instant::now();
        let conns: Vec<_> = (0..5).map(|_| (PeerId::random(), now, 0)).collect();
        assert!(trim_victims(&conns, now + Duration::from_secs(600), &config(2, 5)).is_empty());
    }

    #[test]
    fn lowest_weight_goes_first_and_new_connections_are_spared() {
        let t0 = Instant::now();
        let now = t0 + Duration::from_secs(120);
        let fresh = PeerId::random();
        let weak = PeerId::random();
        let strong = PeerId::random();
        let middle = PeerId::random();
        let conns = vec![
            (fresh, now, 0),
            (weak, t0, 10),
            (strong, t0, 100),
            (middle, t0, 50),
        ];
        let victims = trim_victims(&conns, now, &config(2, 3));
        assert_eq!(victims, vec![weak, middle]);
    }

    #[test]
    fn book_keeps_the_longer_expiry() {
        let mut book = PeerBook::default();
        let peer = PeerId::random();
        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/1".parse().unwrap();
        let now = Instant::now();
        book.add_address(peer, addr.clone(), Some(now + Duration::from_secs(60)));
        book.add_address(peer, addr.clone(), Some(now + Duration::from_secs(10)));
        assert_eq!(
            book.addresses_of(&peer, now + Duration::from_secs(30)),
            vec![addr.clone()]
        );

        book.prune_addresses(now + Duration::from_secs(61));
        assert!(book.addresses_of(&peer, now).is_empty());
        assert!(book.addresses.is_empty());
    }

    #[tokio::test]
    async fn spawned_swarm_listens_and_shuts_down() {
        let config = MeshConfig {
            listen_addrs: vec!["/ip4/127.0.0.1/tcp/0".into()],
            ..MeshConfig::default()
        };
        let substrate =
            SwarmSubstrate::spawn(identity::Keypair::generate_ed25519(), &config).unwrap();
        for _ in 0..50 {
            if !substrate.listen_addrs().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!substrate.listen_addrs().is_empty());
        assert!(substrate.connected_peers().is_empty());
        substrate.shutdown().await;
        assert!(matches!(
            substrate.bootstrap().await,
            Err(SubstrateError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn two_swarms_connect_and_exchange_a_stream() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let config = MeshConfig {
            listen_addrs: vec!["/ip4/127.0.0.1/tcp/0".into()],
            ..MeshConfig::default()
        };
        let a = SwarmSubstrate::spawn(identity::Keypair::generate_ed25519(), &config).unwrap();
        let b = SwarmSubstrate::spawn(identity::Keypair::generate_ed25519(), &config).unwrap();
        let mut inbound = b.accept("/tuns/test/1.0.0").unwrap();
        for _ in 0..50 {
            if !b.listen_addrs().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        a.connect(b.peer_id(), b.listen_addrs()).await.unwrap();
        assert!(a.is_connected(&b.peer_id()));

        let mut out = a.open_stream(b.peer_id(), "/tuns/test/1.0.0").await.unwrap();
        out.write_all(b"ping").await.unwrap();
        out.flush().await.unwrap();
        let mut server_side = inbound.recv().await.unwrap();
        assert_eq!(server_side.peer(), a.peer_id());
        let mut buf = [0u8; 4];
        server_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        a.shutdown().await;
        b.shutdown().await;
    }
}
