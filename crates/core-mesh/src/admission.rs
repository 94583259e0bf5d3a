//! Admission control for inbound proxy and tunnel streams.
//!
//! A fixed number of slots gates concurrent inbound work. Acquisition never
//! waits: when every slot is busy or cooling down the caller is told so
//! immediately. Dropping an [`AdmissionPermit`] does not free its slot right
//! away; the slot stays occupied for a cool-down, which throttles a caller
//! that reconnects as soon as its previous request finished.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Busy,
    CoolingUntil(Instant),
}

#[derive(Debug)]
pub struct AdmissionController {
    slots: Mutex<Vec<SlotState>>,
    cooldown: Duration,
}

impl AdmissionController {
    pub fn new(capacity: usize, cooldown: Duration) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(vec![SlotState::Free; capacity]),
            cooldown,
        })
    }

    fn slots(&self) -> MutexGuard<'_, Vec<SlotState>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims a slot if one is free or finished cooling down.
    pub fn try_acquire(self: &Arc<Self>) -> Option<AdmissionPermit> {
        let now = Instant::now();
        let mut slots = self.slots();
        let index = slots.iter().position(|slot| match slot {
            SlotState::Free => true,
            SlotState::Busy => false,
            SlotState::CoolingUntil(until) => *until <= now,
        })?;
        slots[index] = SlotState::Busy;
        Some(AdmissionPermit {
            controller: Arc::clone(self),
            index,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots().len()
    }

    /// Slots currently running a request.
    pub fn busy(&self) -> usize {
        self.slots()
            .iter()
            .filter(|s| matches!(s, SlotState::Busy))
            .count()
    }

    /// Slots an acquisition made now could claim.
    pub fn available(&self) -> usize {
        let now = Instant::now();
        self.slots()
            .iter()
            .filter(|s| match s {
                SlotState::Free => true,
                SlotState::Busy => false,
                SlotState::CoolingUntil(until) => *until <= now,
            })
            .count()
    }

    fn release(&self, index: usize) {
        let state = if self.cooldown.is_zero() {
            SlotState::Free
        } else {
            SlotState::CoolingUntil(Instant::now() + self.cooldown)
        };
        if let Some(slot) = self.slots().get_mut(index) {
            *slot = state;
        }
    }
}

/// An occupied slot. Dropping it starts the slot's cool-down.
#[derive(Debug)]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
    index: usize,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release(self.index);
    }
}
