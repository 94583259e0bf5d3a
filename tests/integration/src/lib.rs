//! Fixtures shared by the multi-node tests: scripted upstreams and a node
//! wrapper over the in-memory substrate.

use async_trait::async_trait;
use core_mesh::directory::RecordSource;
use core_mesh::memory::{MemoryNetwork, MemoryNode};
use core_mesh::substrate::{Substrate, TagUpdate};
use core_mesh::upstream::{Upstream, UpstreamError};
use core_mesh::wire::{unix_now, VIA_HEADER};
use core_mesh::{
    MeshConfig, MeshService, ProxyRequest, ProxyResponse, ProxyRouter, ServiceContext,
    ServiceManager,
};
use libp2p::multiaddr::Protocol;
use libp2p::PeerId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Answers every request with a fixed status, or fails it outright.
pub struct StubUpstream {
    status: u16,
    fail: bool,
    calls: AtomicUsize,
    via: Mutex<Vec<String>>,
}

impl StubUpstream {
    pub fn ok(status: u16) -> Arc<Self> {
        Arc::new(Self {
            status,
            fail: false,
            calls: AtomicUsize::new(0),
            via: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            status: 0,
            fail: true,
            calls: AtomicUsize::new(0),
            via: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Via chains seen so far, in arrival order.
    pub fn via_chains(&self) -> Vec<String> {
        self.via.lock().unwrap().clone()
    }
}

#[async_trait]
impl Upstream for StubUpstream {
    async fn execute(&self, request: &ProxyRequest) -> Result<ProxyResponse, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(via) = request.header(VIA_HEADER) {
            self.via.lock().unwrap().push(via.to_string());
        }
        if self.fail {
            return Err(UpstreamError::InvalidMethod("scripted failure".into()));
        }
        Ok(ProxyResponse {
            status_code: self.status,
            body: request.url.clone().into_bytes(),
            ..Default::default()
        })
    }
}

/// Holds every request until the gate opens, tracking concurrency.
pub struct GatedUpstream {
    gate: watch::Receiver<bool>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl GatedUpstream {
    pub fn new() -> (Arc<Self>, watch::Sender<bool>) {
        let (open, gate) = watch::channel(false);
        let upstream = Arc::new(Self {
            gate,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        (upstream, open)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for GatedUpstream {
    async fn execute(&self, _request: &ProxyRequest) -> Result<ProxyResponse, UpstreamError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let mut gate = self.gate.clone();
        let _ = gate.wait_for(|open| *open).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ProxyResponse {
            status_code: 200,
            ..Default::default()
        })
    }
}

pub fn mesh_config(hosts: &[&str]) -> MeshConfig {
    MeshConfig {
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        ..MeshConfig::default()
    }
}

/// One mesh node: substrate, shared context and its service manager.
pub struct TestNode {
    pub node: Arc<MemoryNode>,
    pub ctx: ServiceContext,
    pub manager: ServiceManager,
}

impl TestNode {
    pub fn new(net: &MemoryNetwork, config: MeshConfig, upstream: Arc<dyn Upstream>) -> Self {
        let node = net.add_node();
        let ctx = ServiceContext::new(node.clone(), upstream, config);
        let manager = ServiceManager::new(ctx.clone());
        Self { node, ctx, manager }
    }

    pub fn id(&self) -> PeerId {
        self.node.local_peer_id()
    }

    /// `/…/p2p/<id>` form, as used for bootstrap entries.
    pub fn full_addr(&self) -> String {
        self.node.addr().with(Protocol::P2p(self.id())).to_string()
    }

    pub fn serve(&mut self, service: Arc<dyn MeshService>) {
        self.manager
            .register(service)
            .expect("protocol registers once");
    }

    pub fn router(&self) -> ProxyRouter {
        ProxyRouter::new(self.ctx.clone())
    }

    pub async fn connect(&self, other: &TestNode) {
        self.node
            .connect(other.id(), vec![other.node.addr()])
            .await
            .expect("peer is online");
    }

    /// Records `other` as a gossip sighting serving `hosts`, seeded at the
    /// usual sighting quality.
    pub fn learn(&self, other: &TestNode, hosts: &[&str]) {
        self.ctx.directory.merge(
            other.id(),
            hosts.iter().map(|h| h.to_string()).collect(),
            unix_now(),
            RecordSource::Gossip,
            Instant::now(),
        );
        self.ctx.adjust_quality(
            &other.id(),
            TagUpdate::Seed(self.ctx.config.quality.seed_sighting),
        );
    }

    pub fn quality_of(&self, other: &TestNode) -> Option<i32> {
        self.ctx.quality(&other.id())
    }
}

/// Polls `check` until it holds, failing the test after `limit`.
pub async fn eventually<F: FnMut() -> bool>(what: &str, limit: Duration, mut check: F) {
    let deadline = Instant::now() + limit;
    while !check() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
