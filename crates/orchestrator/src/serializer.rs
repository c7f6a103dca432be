//! Per-key run serialisation.
//!
//! Runs for the same [`RunKey`] hold the same async lock for their whole
//! execution, so their graph writes are strictly ordered. Entering a key
//! also bumps its generation: an older ticket that sees a newer generation
//! has been superseded and cancels at its next step boundary. Runs for
//! different keys never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use pipeline::{DeliveryId, RunKey};
use tokio::sync::OwnedMutexGuard;

struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    generation: u64,
    latest: DeliveryId,
    tickets: usize,
}

type Slots = Arc<Mutex<HashMap<RunKey, Slot>>>;

fn lock(slots: &Slots) -> MutexGuard<'_, HashMap<RunKey, Slot>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Hands out [`Ticket`]s per run key.
#[derive(Clone, Default)]
pub struct KeyedSerializer {
    slots: Slots,
}

impl KeyedSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a run for `key`, superseding every earlier ticket for it.
    pub fn enter(&self, key: &RunKey, delivery: &DeliveryId) -> Ticket {
        let mut slots = lock(&self.slots);
        let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
            lock: Arc::new(tokio::sync::Mutex::new(())),
            generation: 0,
            latest: delivery.clone(),
            tickets: 0,
        });
        slot.generation += 1;
        slot.latest = delivery.clone();
        slot.tickets += 1;

        Ticket {
            slots: Arc::clone(&self.slots),
            key: key.clone(),
            generation: slot.generation,
            lock: Arc::clone(&slot.lock),
        }
    }

    /// Keys with at least one live ticket.
    pub fn active_keys(&self) -> usize {
        lock(&self.slots).len()
    }
}

/// One run's place in its key's queue.
pub struct Ticket {
    slots: Slots,
    key: RunKey,
    generation: u64,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Ticket {
    pub fn key(&self) -> &RunKey {
        &self.key
    }

    /// Waits until no other run for this key is executing.
    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.lock).lock_owned().await
    }

    /// The delivery that superseded this run, if a newer one has entered.
    pub fn superseded_by(&self) -> Option<DeliveryId> {
        let slots = lock(&self.slots);
        slots
            .get(&self.key)
            .filter(|slot| slot.generation > self.generation)
            .map(|slot| slot.latest.clone())
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.tickets -= 1;
            if slot.tickets == 0 {
                slots.remove(&self.key);
            }
        }
    }
}
