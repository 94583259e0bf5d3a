//! Peer directory: the shared registry of known mesh peers.
//!
//! Every component reads and mutates peer knowledge through one
//! [`PeerDirectory`] handle. Records are keyed by [`PeerId`], so a peer has at
//! most one record; merges are last-writer-wins on the advertised hosts.
//!
//! # Architecture
//!
//! - **Merge**: gossip and capability exchange insert-or-update records and
//!   refresh `last_seen`
//! - **Candidates**: the router asks for every record whose host patterns
//!   cover a destination, least recently answering peer first
//! - **GC**: records that are disconnected and older than their staleness
//!   window are dropped
//!
//! The map sits behind a single `RwLock`. Every method takes the lock for one
//! scan of the map and returns owned data, so no guard outlives a call and no
//! network operation ever runs while the lock is held.
//!
//! # Example
//!
//! ```
//! use core_mesh::directory::{PeerDirectory, RecordSource};
//! use libp2p::PeerId;
//! use tokio::time::Instant;
//!
//! let directory = PeerDirectory::new();
//! let peer = PeerId::random();
//! directory.merge(peer, vec!["*.example.com".into()], 0, RecordSource::Gossip, Instant::now());
//! assert_eq!(directory.candidates("api.example.com"), vec![peer]);
//! ```

use libp2p::PeerId;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::hosts;

/// How a record was last sighted; selects its staleness window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSource {
    Gossip,
    Exchange,
    Connect,
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    /// Host patterns the peer claims to serve.
    pub hosts: Vec<String>,
    /// Creation time of the announcement, unix seconds, as sent by the peer.
    pub timestamp: i64,
    pub last_seen: Instant,
    /// Last successful proxy round trip through this peer.
    pub last_response: Option<Instant>,
    pub source: RecordSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    /// Existing record whose host list changed.
    Updated,
    /// Existing record re-sighted with the same hosts.
    Refreshed,
}

/// GC thresholds, one per record source.
#[derive(Debug, Clone, Copy)]
pub struct StalenessWindows {
    pub gossip: Duration,
    pub exchange: Duration,
}

impl StalenessWindows {
    fn for_source(&self, source: RecordSource) -> Duration {
        match source {
            RecordSource::Exchange => self.exchange,
            RecordSource::Gossip | RecordSource::Connect => self.gossip,
        }
    }
}

/// One entry of a capability-exchange merge.
#[derive(Debug, Clone)]
pub struct ExchangedRecord {
    pub peer_id: PeerId,
    pub hosts: Vec<String>,
    pub timestamp: i64,
}

/// Cheap-clone handle to the shared peer map.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    records: Arc<RwLock<HashMap<PeerId, PeerRecord>>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<PeerId, PeerRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<PeerId, PeerRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or updates the record for `peer`. The newest message wins:
    /// hosts and timestamp are replaced, `last_response` is kept.
    pub fn merge(
        &self,
        peer: PeerId,
        hosts: Vec<String>,
        timestamp: i64,
        source: RecordSource,
        now: Instant,
    ) -> MergeOutcome {
        let mut records = self.write();
        merge_locked(&mut records, peer, hosts, timestamp, source, now)
    }

    /// Merges a capability-exchange batch. When the directory is full, the
    /// `evict_batch` least recently seen records are dropped before a new
    /// peer is inserted. Returns the peers that were not known before.
    pub fn merge_exchanged(
        &self,
        batch: Vec<ExchangedRecord>,
        max_size: usize,
        evict_batch: usize,
        now: Instant,
    ) -> Vec<PeerId> {
        let mut records = self.write();
        let mut inserted = Vec::new();
        for entry in batch {
            if !records.contains_key(&entry.peer_id) && records.len() >= max_size {
                evict_oldest(&mut records, evict_batch.max(1));
            }
            let outcome = merge_locked(
                &mut records,
                entry.peer_id,
                entry.hosts,
                entry.timestamp,
                RecordSource::Exchange,
                now,
            );
            if outcome == MergeOutcome::Inserted {
                inserted.push(entry.peer_id);
            }
        }
        inserted
    }

    /// Records a successful connect. Known peers get `last_seen` refreshed;
    /// unknown ones get an empty-host record so reconnects can find them.
    pub fn observe_connected(&self, peer: PeerId, now: Instant) -> bool {
        let mut records = self.write();
        match records.get_mut(&peer) {
            Some(record) => {
                record.last_seen = now;
                false
            }
            None => {
                records.insert(
                    peer,
                    PeerRecord {
                        peer_id: peer,
                        hosts: Vec::new(),
                        timestamp: 0,
                        last_seen: now,
                        last_response: None,
                        source: RecordSource::Connect,
                    },
                );
                true
            }
        }
    }

    /// Refreshes `last_seen` of a known peer.
    pub fn touch(&self, peer: &PeerId, now: Instant) -> bool {
        match self.write().get_mut(peer) {
            Some(record) => {
                record.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Stamps a successful round trip. The stored value always moves
    /// forward, even when the clock reads the same instant twice.
    pub fn record_response(&self, peer: &PeerId, now: Instant) -> Option<Instant> {
        let mut records = self.write();
        let record = records.get_mut(peer)?;
        let next = match record.last_response {
            Some(prev) if now <= prev => prev + Duration::from_nanos(1),
            _ => now,
        };
        record.last_response = Some(next);
        Some(next)
    }

    /// Peers whose host patterns cover `host`, ordered by ascending
    /// `last_response` (never answered first), ties broken by peer id.
    pub fn candidates(&self, host: &str) -> Vec<PeerId> {
        let mut matched: Vec<(Option<Instant>, PeerId)> = self
            .read()
            .values()
            .filter(|r| hosts::any_match(&r.hosts, host))
            .map(|r| (r.last_response, r.peer_id))
            .collect();
        matched.sort();
        matched.into_iter().map(|(_, peer)| peer).collect()
    }

    /// Drops every record that is disconnected and unseen for longer than
    /// its window. Connected peers are never removed.
    pub fn collect_garbage(
        &self,
        now: Instant,
        connected: &HashSet<PeerId>,
        windows: StalenessWindows,
    ) -> Vec<PeerId> {
        let mut removed = Vec::new();
        self.write().retain(|peer, record| {
            let keep = connected.contains(peer)
                || now.saturating_duration_since(record.last_seen)
                    <= windows.for_source(record.source);
            if !keep {
                removed.push(*peer);
            }
            keep
        });
        removed
    }

    /// Known peers that are not in `connected`.
    pub fn disconnected_peers(&self, connected: &HashSet<PeerId>) -> Vec<PeerId> {
        self.read()
            .keys()
            .filter(|peer| !connected.contains(peer))
            .copied()
            .collect()
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.read().get(peer).cloned()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.read().contains_key(peer)
    }

    pub fn remove(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.write().remove(peer)
    }

    /// Copy of every record, taken under one read lock.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.read().values().cloned().collect()
    }

    /// Host pattern to the peers advertising it.
    pub fn host_index(&self) -> BTreeMap<String, BTreeSet<PeerId>> {
        let mut index: BTreeMap<String, BTreeSet<PeerId>> = BTreeMap::new();
        for record in self.read().values() {
            for host in &record.hosts {
                index.entry(host.clone()).or_default().insert(record.peer_id);
            }
        }
        index
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

fn merge_locked(
    records: &mut HashMap<PeerId, PeerRecord>,
    peer: PeerId,
    hosts: Vec<String>,
    timestamp: i64,
    source: RecordSource,
    now: Instant,
) -> MergeOutcome {
    match records.get_mut(&peer) {
        Some(record) => {
            let outcome = if record.hosts == hosts {
                MergeOutcome::Refreshed
            } else {
                MergeOutcome::Updated
            };
            record.hosts = hosts;
            record.timestamp = timestamp;
            record.last_seen = now;
            record.source = source;
            outcome
        }
        None => {
            records.insert(
                peer,
                PeerRecord {
                    peer_id: peer,
                    hosts,
                    timestamp,
                    last_seen: now,
                    last_response: None,
                    source,
                },
            );
            MergeOutcome::Inserted
        }
    }
}

fn evict_oldest(records: &mut HashMap<PeerId, PeerRecord>, count: usize) {
    let mut by_age: Vec<(Instant, PeerId)> =
        records.values().map(|r| (r.last_seen, r.peer_id)).collect();
    by_age.sort();
    for (_, peer) in by_age.into_iter().take(count) {
        records.remove(&peer);
    }
}
