//! Internal notification bus for connection and identification events.
//!
//! Each subscriber owns a bounded queue. Publishing never waits: a full queue
//! drops the event for that subscriber only, and queues whose receiver was
//! dropped are pruned on the next publish.

use libp2p::PeerId;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Default per-subscriber queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    /// The peer completed identification and advertised these protocols.
    PeerIdentified { peer: PeerId, protocols: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<MeshEvent>>>>,
    depth: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

impl EventBus {
    pub fn new(depth: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            depth: depth.max(1),
        }
    }

    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::channel(self.depth);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        EventSubscription { rx }
    }

    /// Delivers `event` to every subscriber with room; returns how many got it.
    pub fn publish(&self, event: MeshEvent) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| !tx.is_closed());
        let mut delivered = 0;
        for tx in subscribers.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::debug!("events: subscriber queue full, dropping {:?}", event);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

/// Receiving end of a bus subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct EventSubscription {
    rx: mpsc::Receiver<MeshEvent>,
}

impl EventSubscription {
    pub async fn next(&mut self) -> Option<MeshEvent> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<MeshEvent> {
        self.rx.try_recv().ok()
    }
}
