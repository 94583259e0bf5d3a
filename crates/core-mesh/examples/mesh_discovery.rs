//! Example: join the mesh over libp2p and watch the directory fill up.
//!
//! Run with:
//! ```sh
//! cargo run --example mesh_discovery
//! ```
//!
//! With an entry point:
//! ```sh
//! TUNS_BOOTSTRAP="/ip4/198.51.100.1/tcp/4001/p2p/12D3KooW..." \
//! cargo run --example mesh_discovery
//! ```
//!
//! Two terminals running this example on one machine find each other once
//! the second is pointed at the first one's printed listen address.

use core_mesh::upstream::HttpUpstream;
use core_mesh::{
    register_default_services, status, MeshConfig, ServiceContext, ServiceManager, SwarmSubstrate,
};
use libp2p::identity;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("tuns mesh discovery example");
    println!("===========================\n");

    let mut config = MeshConfig {
        listen_addrs: vec!["/ip4/127.0.0.1/tcp/0".to_string()],
        ..MeshConfig::default()
    };
    if let Ok(bootstrap) = std::env::var("TUNS_BOOTSTRAP") {
        config.bootstrap_peers = bootstrap
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    if config.bootstrap_peers.is_empty() {
        println!("No bootstrap peers configured, waiting to be dialed\n");
    }

    let keypair = identity::Keypair::generate_ed25519();
    let substrate = SwarmSubstrate::spawn(keypair, &config)?;
    println!("Local peer id: {}", substrate.peer_id());

    let upstream = Arc::new(HttpUpstream::new(Duration::from_secs(30))?);
    let ctx = ServiceContext::new(substrate.clone(), upstream, config);
    let mut manager = ServiceManager::new(ctx.clone());
    register_default_services(&mut manager)?;
    manager.start_all().await?;
    println!("Services: {:?}\n", manager.service_names());

    for round in 1..=10 {
        tokio::time::sleep(Duration::from_secs(3)).await;
        let snapshot = status::snapshot(&ctx);
        if round == 1 {
            for addr in &snapshot.listen_addrs {
                println!("Listening on {}/p2p/{}", addr, snapshot.peer_id);
            }
        }
        println!(
            "[{}] connections: {}, mesh peers: {}, directory: {}",
            round, snapshot.total_conns, snapshot.mesh_peers_count, snapshot.directory_size
        );
        for (host, peers) in snapshot.known_hosts.iter().take(5) {
            println!("    {} -> {} peers", host, peers.len());
        }
    }

    manager.shutdown().await;
    substrate.shutdown().await;
    println!("\nDiscovery example complete");
    Ok(())
}
