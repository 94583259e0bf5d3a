//! Shared state handed to every mesh service.

use libp2p::PeerId;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::admission::AdmissionController;
use crate::config::{MeshConfig, QUALITY_TAG};
use crate::directory::PeerDirectory;
use crate::substrate::{Substrate, TagUpdate};
use crate::upstream::Upstream;

/// The handle every service is constructed from.
///
/// Lock discipline, per field:
/// - `directory`: one `RwLock` around the peer map. Each accessor holds it
///   for a single scan and returns owned data. Never call the substrate or
///   await while holding a snapshot you intend to write back; write through
///   the accessors instead.
/// - `substrate`: owns its own locks, including the quality tag store, which
///   is only changed through [`Substrate::update_tag`].
/// - `admission`: a short `Mutex` around the slot table, never awaited on.
/// - `config`, `upstream`: immutable after construction.
/// - `shutdown`: observed by every background loop at its wait point.
#[derive(Clone)]
pub struct ServiceContext {
    pub substrate: Arc<dyn Substrate>,
    pub directory: PeerDirectory,
    pub admission: Arc<AdmissionController>,
    pub upstream: Arc<dyn Upstream>,
    pub config: Arc<MeshConfig>,
    pub shutdown: CancellationToken,
}

impl ServiceContext {
    pub fn new(
        substrate: Arc<dyn Substrate>,
        upstream: Arc<dyn Upstream>,
        config: MeshConfig,
    ) -> Self {
        let admission = AdmissionController::new(
            config.admission.slots,
            Duration::from_secs(config.admission.cooldown_secs),
        );
        Self {
            substrate,
            directory: PeerDirectory::new(),
            admission,
            upstream,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.substrate.local_peer_id()
    }

    pub fn connected_set(&self) -> HashSet<PeerId> {
        self.substrate.connected_peers().into_iter().collect()
    }

    /// Applies `update` to the peer's quality tag.
    pub fn adjust_quality(&self, peer: &PeerId, update: TagUpdate) -> i32 {
        self.substrate.update_tag(peer, QUALITY_TAG, update)
    }

    pub fn quality(&self, peer: &PeerId) -> Option<i32> {
        self.substrate.tag(peer, QUALITY_TAG)
    }

    /// Sleeps for `period` unless shutdown comes first; false on shutdown.
    pub async fn pause(&self, period: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(period) => true,
        }
    }
}
