//! Per-peer request spacing for the exchange protocols.

use libp2p::PeerId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

#[derive(Debug)]
pub struct CooldownLedger {
    cooldown: Duration,
    last_request: Mutex<HashMap<PeerId, Instant>>,
}

impl CooldownLedger {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_request: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PeerId, Instant>> {
        self.last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a request to `peer` unless the previous one is too recent.
    ///
    /// Check and record happen under one lock, so two racing triggers for the
    /// same peer produce one request.
    pub fn try_mark(&self, peer: PeerId, now: Instant) -> bool {
        let mut entries = self.entries();
        match entries.get(&peer) {
            Some(last) if now.saturating_duration_since(*last) < self.cooldown => false,
            _ => {
                entries.insert(peer, now);
                true
            }
        }
    }

    /// Drops entries older than `ttl`; returns how many went.
    pub fn prune(&self, now: Instant, ttl: Duration) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, last| now.saturating_duration_since(*last) <= ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cooldown ledger plus a small fan-out limiter.
///
/// Admission never waits: a trigger that finds every worker busy is dropped,
/// the next event or sweep will try again.
#[derive(Debug)]
pub struct RequestGate {
    ledger: CooldownLedger,
    workers: Arc<Semaphore>,
}

impl RequestGate {
    pub fn new(cooldown: Duration, workers: usize) -> Self {
        Self {
            ledger: CooldownLedger::new(cooldown),
            workers: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// A worker permit for a request to `peer`, if the peer is out of its
    /// cooldown and a worker is free.
    pub fn admit(&self, peer: PeerId, now: Instant) -> Option<OwnedSemaphorePermit> {
        let permit = Arc::clone(&self.workers).try_acquire_owned().ok()?;
        self.ledger.try_mark(peer, now).then_some(permit)
    }

    pub fn ledger(&self) -> &CooldownLedger {
        &self.ledger
    }
}
