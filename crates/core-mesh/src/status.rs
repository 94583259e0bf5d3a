//! Read-only node status for dashboards and the HTTP status endpoint.

use chrono::{DateTime, Utc};
use libp2p::{Multiaddr, PeerId};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

use crate::config::speaks_mesh_protocol;
use crate::context::ServiceContext;

#[derive(Debug, Clone, Serialize)]
pub struct PeerDetail {
    pub id: String,
    pub addrs: Vec<String>,
    pub protocols: Vec<String>,
    pub is_mesh: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeshStatus {
    pub peer_id: String,
    pub listen_addrs: Vec<String>,
    pub total_conns: usize,
    pub mesh_peers_count: usize,
    pub directory_size: usize,
    /// Host pattern to the ids of peers claiming it.
    pub known_hosts: BTreeMap<String, Vec<String>>,
    pub peers: Vec<PeerDetail>,
    pub mesh_peers: Vec<PeerDetail>,
}

/// Wall-clock rendering of a monotonic instant in the past.
fn wall_clock(at: Instant, now: Instant, wall_now: DateTime<Utc>) -> String {
    let ago = chrono::Duration::from_std(now.saturating_duration_since(at))
        .unwrap_or_else(|_| chrono::Duration::zero());
    (wall_now - ago).to_rfc3339()
}

fn addr_strings(addrs: &[Multiaddr]) -> Vec<String> {
    addrs.iter().map(Multiaddr::to_string).collect()
}

/// Builds a status snapshot. The directory is copied first and released
/// before any of it is formatted.
pub fn snapshot(ctx: &ServiceContext) -> MeshStatus {
    let records = ctx.directory.snapshot();
    let host_index = ctx.directory.host_index();
    let now = Instant::now();
    let wall_now = Utc::now();

    let last_seen: HashMap<PeerId, Instant> =
        records.iter().map(|r| (r.peer_id, r.last_seen)).collect();

    let substrate = &ctx.substrate;
    let mut connected = substrate.connected_peers();
    connected.sort();

    let peers: Vec<PeerDetail> = connected
        .iter()
        .map(|peer| {
            let protocols = substrate.protocols_of(peer);
            PeerDetail {
                id: peer.to_string(),
                addrs: addr_strings(&substrate.addresses_of(peer)),
                is_mesh: speaks_mesh_protocol(&protocols),
                protocols,
                last_seen: last_seen.get(peer).map(|at| wall_clock(*at, now, wall_now)),
            }
        })
        .collect();
    let mesh_peers: Vec<PeerDetail> = peers.iter().filter(|p| p.is_mesh).cloned().collect();

    MeshStatus {
        peer_id: ctx.local_peer_id().to_string(),
        listen_addrs: addr_strings(&substrate.listen_addrs()),
        total_conns: connected.len(),
        mesh_peers_count: mesh_peers.len(),
        directory_size: records.len(),
        known_hosts: host_index
            .into_iter()
            .map(|(host, peers)| (host, peers.iter().map(PeerId::to_string).collect()))
            .collect(),
        peers,
        mesh_peers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::directory::RecordSource;
    use crate::memory::MemoryNetwork;
    use crate::substrate::Substrate;
    use crate::upstream::HttpUpstream;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wall_clock_subtracts_elapsed_time() {
        let now = Instant::now();
        let wall_now = Utc::now();
        let rendered = wall_clock(now, now + Duration::from_secs(90), wall_now);
        let parsed = DateTime::parse_from_rfc3339(&rendered).unwrap();
        assert_eq!((wall_now - parsed.with_timezone(&Utc)).num_seconds(), 90);
    }

    #[tokio::test]
    async fn snapshot_reports_peers_and_hosts() {
        let net = MemoryNetwork::new();
        let node = net.add_node();
        let mesh = net.add_node();
        let _handler = mesh.accept("/tuns/proxy/1.0.0").unwrap();
        let plain = net.add_node();
        node.connect(mesh.local_peer_id(), vec![]).await.unwrap();
        node.connect(plain.local_peer_id(), vec![]).await.unwrap();

        let upstream = Arc::new(HttpUpstream::new(Duration::from_secs(1)).unwrap());
        let ctx = ServiceContext::new(node.clone(), upstream, MeshConfig::default());
        ctx.directory.merge(
            mesh.local_peer_id(),
            vec!["*.example.com".into()],
            0,
            RecordSource::Gossip,
            Instant::now(),
        );

        let status = snapshot(&ctx);
        assert_eq!(status.peer_id, node.local_peer_id().to_string());
        assert_eq!(status.total_conns, 2);
        assert_eq!(status.mesh_peers_count, 1);
        assert_eq!(status.directory_size, 1);
        assert_eq!(
            status.known_hosts["*.example.com"],
            vec![mesh.local_peer_id().to_string()]
        );
        let mesh_detail = &status.mesh_peers[0];
        assert_eq!(mesh_detail.id, mesh.local_peer_id().to_string());
        assert!(mesh_detail.last_seen.is_some());
        assert!(status
            .peers
            .iter()
            .any(|p| p.id == plain.local_peer_id().to_string() && !p.is_mesh));
    }
}
