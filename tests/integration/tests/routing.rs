use core_mesh::memory::MemoryNetwork;
use core_mesh::proxy::ProxyService;
use core_mesh::tunnel::TunnelService;
use core_mesh::wire::VIA_HEADER;
use core_mesh::{ProxyRequest, RouteError};
use mesh_integration_tests::{mesh_config, StubUpstream, TestNode};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::Instant;

fn proxy_node(net: &MemoryNetwork, hosts: &[&str], upstream: Arc<StubUpstream>) -> TestNode {
    let mut node = TestNode::new(net, mesh_config(hosts), upstream);
    node.serve(ProxyService::new(node.ctx.clone()));
    node
}

#[tokio::test]
async fn served_hosts_never_touch_the_directory() {
    let net = MemoryNetwork::new();
    let local = StubUpstream::ok(200);
    let remote = StubUpstream::ok(200);
    let x = TestNode::new(&net, mesh_config(&["api.example.com"]), local.clone());
    let y = proxy_node(&net, &["*.example.com"], remote.clone());
    x.learn(&y, &["*.example.com"]);

    let response = x
        .router()
        .route(ProxyRequest::get("http://api.example.com/v3"))
        .await
        .unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(local.calls(), 1);
    assert_eq!(remote.calls(), 0);
    assert_eq!(x.quality_of(&y), Some(60));
}

#[tokio::test]
async fn least_recently_answered_peer_goes_first() {
    let net = MemoryNetwork::new();
    let y_up = StubUpstream::ok(200);
    let z_up = StubUpstream::ok(200);
    let x = TestNode::new(&net, mesh_config(&[]), StubUpstream::ok(200));
    let y = proxy_node(&net, &["*.example.com"], y_up.clone());
    let z = proxy_node(&net, &["*.example.com"], z_up.clone());
    x.learn(&y, &["*.example.com"]);
    x.learn(&z, &["*.example.com"]);
    x.connect(&y).await;
    x.connect(&z).await;

    let t0 = Instant::now();
    x.ctx.directory.record_response(&y.id(), t0);
    x.ctx
        .directory
        .record_response(&z.id(), t0 + Duration::from_micros(1));

    let router = x.router();
    router
        .route(ProxyRequest::get("http://other.example.com/"))
        .await
        .unwrap();
    assert_eq!((y_up.calls(), z_up.calls()), (1, 0));
    assert_eq!(x.quality_of(&y), Some(70));
    let stamped = x.ctx.directory.get(&y.id()).unwrap().last_response.unwrap();
    assert!(stamped > t0);

    // y just answered, so z is now the least recent
    router
        .route(ProxyRequest::get("http://other.example.com/"))
        .await
        .unwrap();
    assert_eq!((y_up.calls(), z_up.calls()), (1, 1));
}

#[tokio::test]
async fn busy_peer_is_skipped_with_a_light_penalty() {
    let net = MemoryNetwork::new();
    let y_up = StubUpstream::ok(200);
    let z_up = StubUpstream::ok(200);
    let x = TestNode::new(&net, mesh_config(&[]), StubUpstream::ok(200));

    let mut busy = mesh_config(&["*.example.com"]);
    busy.admission.slots = 0;
    let mut y = TestNode::new(&net, busy, y_up.clone());
    y.serve(ProxyService::new(y.ctx.clone()));
    let z = proxy_node(&net, &["*.example.com"], z_up.clone());

    x.learn(&y, &["*.example.com"]);
    x.learn(&z, &["*.example.com"]);
    let t0 = Instant::now();
    x.ctx.directory.record_response(&y.id(), t0);
    x.ctx
        .directory
        .record_response(&z.id(), t0 + Duration::from_micros(1));

    let response = x
        .router()
        .route(ProxyRequest::get("http://other.example.com/p"))
        .await
        .unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, b"http://other.example.com/p");
    assert_eq!(y_up.calls(), 0);
    assert_eq!(z_up.calls(), 1);
    assert_eq!(x.quality_of(&y), Some(50));
    assert_eq!(x.quality_of(&z), Some(70));
}

#[tokio::test]
async fn failing_peers_exhaust_the_candidates() {
    let net = MemoryNetwork::new();
    let x = TestNode::new(&net, mesh_config(&[]), StubUpstream::ok(200));
    let y = proxy_node(&net, &["*.example.com"], StubUpstream::failing());
    x.learn(&y, &["*.example.com"]);

    let err = x
        .router()
        .route(ProxyRequest::get("http://api.example.com/"))
        .await
        .unwrap_err();
    match &err {
        RouteError::AllCandidatesFailed { host, last_error } => {
            assert_eq!(host, "api.example.com");
            assert!(last_error.contains("603"), "{last_error}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(err.http_status(), 502);
    assert_eq!(x.quality_of(&y), Some(40));
}

#[tokio::test]
async fn peers_refuse_hosts_they_do_not_serve() {
    let net = MemoryNetwork::new();
    let y_up = StubUpstream::ok(200);
    let x = TestNode::new(&net, mesh_config(&[]), StubUpstream::ok(200));
    let y = proxy_node(&net, &["api.example.com"], y_up.clone());
    // stale directory entry claims more than y serves
    x.learn(&y, &["*.example.com"]);

    let err = x
        .router()
        .route(ProxyRequest::get("http://www.example.com/"))
        .await
        .unwrap_err();
    assert!(matches!(err, RouteError::AllCandidatesFailed { .. }));
    assert_eq!(y_up.calls(), 0);
}

#[tokio::test]
async fn each_hop_is_recorded_and_loops_are_refused() {
    let net = MemoryNetwork::new();
    let y_up = StubUpstream::ok(200);
    let x = TestNode::new(&net, mesh_config(&[]), StubUpstream::ok(200));
    let y = proxy_node(&net, &["*.example.com"], y_up.clone());
    x.learn(&y, &["*.example.com"]);
    let router = x.router();

    router
        .route(ProxyRequest::get("http://api.example.com/"))
        .await
        .unwrap();
    assert_eq!(
        y_up.via_chains(),
        vec![format!("{}, {}", x.id(), y.id())]
    );

    let mut looped = ProxyRequest::get("http://api.example.com/");
    looped
        .headers
        .insert(VIA_HEADER.to_string(), format!("{}, {}", y.id(), x.id()));
    let err = router.route(looped).await.unwrap_err();
    assert!(matches!(err, RouteError::Loop));
    assert_eq!(y_up.calls(), 1);
}

#[tokio::test]
async fn tunnels_reach_hosts_a_peer_serves() {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = echo.accept().await.unwrap();
        let (mut r, mut w) = socket.split();
        let _ = tokio::io::copy(&mut r, &mut w).await;
    });

    let net = MemoryNetwork::new();
    let x = TestNode::new(&net, mesh_config(&[]), StubUpstream::ok(200));
    let mut y = TestNode::new(&net, mesh_config(&["127.0.0.1"]), StubUpstream::ok(200));
    y.serve(TunnelService::new(y.ctx.clone()));
    x.learn(&y, &["127.0.0.1"]);

    let mut tunnel = x
        .router()
        .open_tunnel(&echo_addr.to_string())
        .await
        .unwrap();
    assert_eq!(tunnel.peer(), y.id());
    tunnel.write_all(b"ping through the mesh").await.unwrap();
    let mut buf = [0u8; 21];
    tunnel.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping through the mesh");
    assert_eq!(x.quality_of(&y), Some(70));

    let err = x.router().open_tunnel("elsewhere.org:443").await.unwrap_err();
    assert!(matches!(err, RouteError::NoCandidates { .. }));
}

#[tokio::test]
async fn refused_tunnels_move_on_to_the_next_peer() {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = echo.accept().await.unwrap();
        let (mut r, mut w) = socket.split();
        let _ = tokio::io::copy(&mut r, &mut w).await;
    });

    let net = MemoryNetwork::new();
    let x = TestNode::new(&net, mesh_config(&[]), StubUpstream::ok(200));
    let mut full = mesh_config(&["127.0.0.1"]);
    full.admission.slots = 0;
    let mut y = TestNode::new(&net, full, StubUpstream::ok(200));
    y.serve(TunnelService::new(y.ctx.clone()));
    let mut z = TestNode::new(&net, mesh_config(&["127.0.0.1"]), StubUpstream::ok(200));
    z.serve(TunnelService::new(z.ctx.clone()));
    // w answers but does not serve the destination
    let mut w = TestNode::new(&net, mesh_config(&["*.example.com"]), StubUpstream::ok(200));
    w.serve(TunnelService::new(w.ctx.clone()));

    x.learn(&w, &["127.0.0.1"]);
    x.learn(&y, &["127.0.0.1"]);
    x.learn(&z, &["127.0.0.1"]);
    let t0 = Instant::now();
    x.ctx.directory.record_response(&w.id(), t0);
    x.ctx
        .directory
        .record_response(&y.id(), t0 + Duration::from_micros(1));
    x.ctx
        .directory
        .record_response(&z.id(), t0 + Duration::from_micros(2));

    let mut tunnel = x
        .router()
        .open_tunnel(&echo_addr.to_string())
        .await
        .unwrap();
    assert_eq!(tunnel.peer(), z.id());
    tunnel.write_all(b"second choice").await.unwrap();
    let mut buf = [0u8; 13];
    tunnel.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"second choice");

    assert_eq!(x.quality_of(&w), Some(40));
    assert_eq!(x.quality_of(&y), Some(50));
    assert_eq!(x.quality_of(&z), Some(70));
    let record = |node: &TestNode| x.ctx.directory.get(&node.id()).unwrap().last_response;
    assert_eq!(record(&w), Some(t0));
    assert_eq!(record(&y), Some(t0 + Duration::from_micros(1)));
    assert!(record(&z).unwrap() > t0 + Duration::from_micros(2));
}
