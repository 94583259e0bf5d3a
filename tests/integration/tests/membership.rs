use core_mesh::directory::RecordSource;
use core_mesh::discovery::DiscoveryService;
use core_mesh::gossip::GossipService;
use core_mesh::hostpex::HostPexService;
use core_mesh::memory::MemoryNetwork;
use core_mesh::pex::PexService;
use core_mesh::ping::PingService;
use core_mesh::proxy::ProxyService;
use core_mesh::substrate::Substrate;
use core_mesh::{register_default_services, status, ProxyRequest};
use mesh_integration_tests::{eventually, mesh_config, StubUpstream, TestNode};
use std::time::Duration;

const SETTLE: Duration = Duration::from_secs(5);

#[tokio::test]
async fn gossiped_hosts_become_routable() {
    let net = MemoryNetwork::new();
    let served = StubUpstream::ok(200);
    let mut a = TestNode::new(&net, mesh_config(&["*.example.com"]), served.clone());
    a.serve(ProxyService::new(a.ctx.clone()));
    let mut b = TestNode::new(&net, mesh_config(&[]), StubUpstream::ok(200));
    b.serve(GossipService::new(b.ctx.clone()));
    b.manager.start_all().await.unwrap();

    let announcer = GossipService::new(a.ctx.clone());
    assert!(announcer.announce_once().await.unwrap());
    let a_id = a.id();
    eventually("b to hear a", SETTLE, || b.ctx.directory.contains(&a_id)).await;

    let record = b.ctx.directory.get(&a_id).unwrap();
    assert_eq!(record.hosts, vec!["*.example.com"]);
    assert_eq!(record.source, RecordSource::Gossip);
    assert_eq!(b.quality_of(&a), Some(60));

    let response = b
        .router()
        .route(ProxyRequest::get("http://cdn.example.com/img"))
        .await
        .unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(served.calls(), 1);
    assert!(b.node.is_connected(&a_id));

    b.manager.shutdown().await;
}

#[tokio::test]
async fn capability_exchange_runs_when_a_peer_is_identified() {
    let net = MemoryNetwork::new();
    let mut a = TestNode::new(&net, mesh_config(&["a.example.com"]), StubUpstream::ok(200));
    let c = TestNode::new(&net, mesh_config(&["c.example.com"]), StubUpstream::ok(200));
    a.learn(&c, &["c.example.com"]);
    a.serve(HostPexService::new(a.ctx.clone()));

    let mut b = TestNode::new(&net, mesh_config(&[]), StubUpstream::ok(200));
    b.serve(HostPexService::new(b.ctx.clone()));
    b.manager.start_all().await.unwrap();

    b.connect(&a).await;
    let (a_id, c_id) = (a.id(), c.id());
    eventually("b to learn a and c", SETTLE, || {
        b.ctx.directory.contains(&a_id) && b.ctx.directory.contains(&c_id)
    })
    .await;

    let learned = b.ctx.directory.get(&c_id).unwrap();
    assert_eq!(learned.hosts, vec!["c.example.com"]);
    assert_eq!(learned.source, RecordSource::Exchange);
    assert_eq!(b.ctx.quality(&c_id), Some(60));
    assert_eq!(
        b.ctx.directory.get(&a_id).unwrap().hosts,
        vec!["a.example.com"]
    );

    b.manager.shutdown().await;
}

#[tokio::test]
async fn address_exchange_fills_the_address_book() {
    let net = MemoryNetwork::new();
    let mut a = TestNode::new(&net, mesh_config(&[]), StubUpstream::ok(200));
    a.serve(PexService::new(a.ctx.clone()));
    let mut c = TestNode::new(&net, mesh_config(&[]), StubUpstream::ok(200));
    c.serve(PingService::new(c.ctx.clone()));
    // plain peer without any mesh protocol
    let d = TestNode::new(&net, mesh_config(&[]), StubUpstream::ok(200));
    a.connect(&c).await;
    a.connect(&d).await;

    let b = TestNode::new(&net, mesh_config(&[]), StubUpstream::ok(200));
    b.connect(&a).await;
    let pex = PexService::new(b.ctx.clone());
    assert_eq!(pex.request_from(a.id()).await.unwrap(), 1);

    assert_eq!(b.node.addresses_of(&c.id()), vec![c.node.addr()]);
    assert!(b.node.addresses_of(&d.id()).is_empty());
    b.node
        .connect(c.id(), b.node.addresses_of(&c.id()))
        .await
        .unwrap();
    assert!(b.node.is_connected(&c.id()));
}

#[tokio::test]
async fn rendezvous_connects_providers_and_reconnects_dropped_ones() {
    let net = MemoryNetwork::new();
    let a = TestNode::new(&net, mesh_config(&[]), StubUpstream::ok(200));
    let b = TestNode::new(&net, mesh_config(&[]), StubUpstream::ok(200));
    let c = TestNode::new(&net, mesh_config(&[]), StubUpstream::ok(200));
    let da = DiscoveryService::new(a.ctx.clone());
    for node in [&b, &c] {
        DiscoveryService::new(node.ctx.clone())
            .announce_once()
            .await
            .unwrap();
    }

    let mut found = da.find_once().await;
    found.sort();
    let mut expected = vec![b.id(), c.id()];
    expected.sort();
    assert_eq!(found, expected);
    assert_eq!(a.ctx.connected_set().len(), 2);
    assert_eq!(a.quality_of(&b), Some(100));

    assert!(net.disconnect(&a.id(), &c.id()));
    assert!(!a.node.is_connected(&c.id()));
    assert_eq!(da.reconnect_once().await, 1);
    assert!(a.node.is_connected(&c.id()));
}

#[tokio::test]
async fn full_nodes_join_through_a_bootstrap_peer() {
    let net = MemoryNetwork::new();
    let served = StubUpstream::ok(200);
    let mut a = TestNode::new(&net, mesh_config(&["*.example.com"]), served.clone());
    register_default_services(&mut a.manager).unwrap();
    a.manager.start_all().await.unwrap();

    let mut config = mesh_config(&[]);
    config.bootstrap_peers = vec![a.full_addr()];
    let mut b = TestNode::new(&net, config, StubUpstream::ok(200));
    register_default_services(&mut b.manager).unwrap();
    assert_eq!(
        b.manager.service_names(),
        vec!["ping", "proxy", "tunnel", "hostpex", "pex", "gossip", "discovery"]
    );
    b.manager.start_all().await.unwrap();

    let a_id = a.id();
    eventually("b to learn what a serves", SETTLE, || {
        b.ctx
            .directory
            .get(&a_id)
            .is_some_and(|r| r.hosts == vec!["*.example.com"])
    })
    .await;

    let response = b
        .router()
        .route(ProxyRequest::get("http://www.example.com/"))
        .await
        .unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(served.calls(), 1);

    let snapshot = status::snapshot(&b.ctx);
    assert_eq!(snapshot.peer_id, b.id().to_string());
    assert!(snapshot.total_conns >= 1);

    b.manager.shutdown().await;
    a.manager.shutdown().await;
}
