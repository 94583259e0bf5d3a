//! Mesh layer of the tuns proxy overlay.
//!
//! Nodes that can reach some set of hosts directly advertise those hosts to
//! the mesh; nodes that cannot forward requests, or open raw byte tunnels,
//! through peers that can. Discovery runs over a Kademlia rendezvous key,
//! host knowledge spreads by gossip and two peer-exchange protocols, and the
//! router picks exit peers by connection quality.
//!
//! Services are written against [`substrate::Substrate`], implemented over
//! libp2p by [`swarm::SwarmSubstrate`] and in memory by
//! [`memory::MemoryNetwork`].

pub mod admission;
pub mod config;
pub mod context;
pub mod cooldown;
pub mod dialer;
pub mod directory;
pub mod discovery;
pub mod events;
pub mod gossip;
pub mod hostpex;
pub mod hosts;
pub mod memory;
pub mod pex;
pub mod ping;
pub mod proxy;
pub mod router;
pub mod rpc;
pub mod service;
pub mod status;
pub mod substrate;
pub mod swarm;
pub mod tunnel;
pub mod upstream;
pub mod wire;

pub use config::MeshConfig;
pub use context::ServiceContext;
pub use directory::{PeerDirectory, PeerRecord};
pub use router::{ProxyRouter, RouteError};
pub use service::{MeshError, MeshService, ServiceManager};
pub use status::MeshStatus;
pub use substrate::{PeerStream, Substrate, SubstrateError};
pub use swarm::SwarmSubstrate;
pub use wire::{ProxyRequest, ProxyResponse};

/// Registers the full service set on `manager`, in start order.
///
/// Protocol handlers come first so that peers found by discovery are
/// answered as soon as they connect.
pub fn register_default_services(manager: &mut ServiceManager) -> Result<(), MeshError> {
    let ctx = manager.context().clone();
    manager.register(ping::PingService::new(ctx.clone()))?;
    manager.register(proxy::ProxyService::new(ctx.clone()))?;
    manager.register(tunnel::TunnelService::new(ctx.clone()))?;
    manager.register(hostpex::HostPexService::new(ctx.clone()))?;
    manager.register(pex::PexService::new(ctx.clone()))?;
    manager.register(gossip::GossipService::new(ctx.clone()))?;
    manager.register(discovery::DiscoveryService::new(ctx))?;
    Ok(())
}
