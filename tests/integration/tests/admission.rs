use core_mesh::memory::MemoryNetwork;
use core_mesh::proxy::{request_peer, ProxyService};
use core_mesh::wire::STATUS_NO_CAPACITY;
use core_mesh::ProxyRequest;
use mesh_integration_tests::{eventually, mesh_config, GatedUpstream, StubUpstream, TestNode};
use std::sync::Arc;
use std::time::Duration;

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn request_beyond_capacity_is_answered_busy() {
    let net = MemoryNetwork::new();
    let (gated, open) = GatedUpstream::new();
    let mut config = mesh_config(&["*.example.com"]);
    config.admission.slots = 2;
    config.admission.cooldown_secs = 0;
    let mut server = TestNode::new(&net, config, gated.clone());
    server.serve(ProxyService::new(server.ctx.clone()));

    let client = TestNode::new(&net, mesh_config(&[]), StubUpstream::ok(200));
    client.connect(&server).await;
    let target = server.id();

    let mut held = Vec::new();
    for _ in 0..2 {
        let substrate = Arc::clone(&client.ctx.substrate);
        held.push(tokio::spawn(async move {
            request_peer(
                substrate.as_ref(),
                target,
                &ProxyRequest::get("http://api.example.com/slow"),
                CALL_TIMEOUT,
            )
            .await
        }));
    }
    eventually("both slots busy", CALL_TIMEOUT, || gated.in_flight() == 2).await;
    assert_eq!(server.ctx.admission.available(), 0);

    let third = request_peer(
        client.ctx.substrate.as_ref(),
        target,
        &ProxyRequest::get("http://api.example.com/fast"),
        CALL_TIMEOUT,
    )
    .await
    .unwrap();
    assert_eq!(third.status_code, STATUS_NO_CAPACITY);
    assert!(third.is_busy());

    open.send(true).unwrap();
    for handle in held {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.status_code, 200);
    }
    assert_eq!(gated.peak(), 2);
}

#[tokio::test]
async fn slot_is_held_through_the_cooldown() {
    let net = MemoryNetwork::new();
    let upstream = StubUpstream::ok(200);
    let mut config = mesh_config(&["*.example.com"]);
    config.admission.slots = 1;
    config.admission.cooldown_secs = 1;
    let mut server = TestNode::new(&net, config, upstream.clone());
    server.serve(ProxyService::new(server.ctx.clone()));

    let client = TestNode::new(&net, mesh_config(&[]), StubUpstream::ok(200));
    client.connect(&server).await;
    let request = ProxyRequest::get("http://api.example.com/");
    let call = || {
        request_peer(
            client.ctx.substrate.as_ref(),
            server.id(),
            &request,
            CALL_TIMEOUT,
        )
    };

    assert_eq!(call().await.unwrap().status_code, 200);
    // the server may still be inside the handler; either way the slot is taken
    assert_eq!(call().await.unwrap().status_code, STATUS_NO_CAPACITY);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(call().await.unwrap().status_code, 200);
    assert_eq!(upstream.calls(), 2);
}
