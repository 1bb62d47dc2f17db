use std::{num::NonZeroUsize, sync::Arc};

use metrics::gauge;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Fixed-size pool of render slots. Acquisition never waits: a saturated gate
/// answers `None` and the caller reports the service as busy.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionGate {
    pub fn new(capacity: NonZeroUsize) -> Self {
        let capacity = capacity.get();
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Take a slot if one is free. The slot returns to the pool when the
    /// returned value is released or dropped.
    pub fn try_acquire(&self) -> Option<AdmissionSlot> {
        let permit = Arc::clone(&self.slots).try_acquire_owned().ok()?;
        self.record_in_flight();
        Some(AdmissionSlot {
            permit: Some(permit),
            gate: self.clone(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.available()
    }

    fn record_in_flight(&self) {
        gauge!("texshot_render_in_flight").set(self.in_flight() as f64);
    }
}

/// One unit of render capacity, held for the duration of a pipeline run.
#[derive(Debug)]
pub struct AdmissionSlot {
    permit: Option<OwnedSemaphorePermit>,
    gate: AdmissionGate,
}

impl AdmissionSlot {
    pub fn release(mut self) {
        self.return_permit();
    }

    fn return_permit(&mut self) {
        if let Some(permit) = self.permit.take() {
            drop(permit);
            self.gate.record_in_flight();
        }
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.return_permit();
    }
}
