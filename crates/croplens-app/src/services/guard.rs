//! Per-record serialization of analysis runs.
//!
//! An arena of async mutexes keyed by record id. Independent records
//! proceed fully in parallel; within one record at most one analysis run
//! holds the permit at a time, whichever pipeline asked for it. Entries
//! are evicted from the arena once uncontended so the map does not grow
//! with every record ever analyzed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::timeout;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardError {
    #[error("an analysis is already running for record {0}")]
    Busy(u64),
    #[error("timed out waiting for the record {0} analysis guard")]
    WaitTimeout(u64),
}

#[derive(Debug)]
pub struct AnalysisGuard {
    slots: Mutex<HashMap<u64, Arc<AsyncMutex<()>>>>,
    wait_timeout: Duration,
}

impl AnalysisGuard {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            wait_timeout,
        }
    }

    fn slot(&self, record_id: u64) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().expect("guard arena poisoned");
        Arc::clone(slots.entry(record_id).or_default())
    }

    /// Fail-fast acquisition: returns `Busy` if another run holds the
    /// record. Used by the asynchronous registration submit path.
    pub fn try_acquire(self: &Arc<Self>, record_id: u64) -> Result<GuardPermit, GuardError> {
        let slot = self.slot(record_id);
        let lock = slot
            .try_lock_owned()
            .map_err(|_| GuardError::Busy(record_id))?;
        Ok(GuardPermit {
            record_id,
            arena: Arc::clone(self),
            lock: Some(lock),
        })
    }

    /// Bounded-wait acquisition: waits at most the configured guard-wait
    /// timeout, then fails so a stuck lock cannot wedge a record forever.
    pub async fn acquire(self: &Arc<Self>, record_id: u64) -> Result<GuardPermit, GuardError> {
        let slot = self.slot(record_id);
        let lock = timeout(self.wait_timeout, slot.lock_owned())
            .await
            .map_err(|_| GuardError::WaitTimeout(record_id))?;
        Ok(GuardPermit {
            record_id,
            arena: Arc::clone(self),
            lock: Some(lock),
        })
    }

    #[cfg(test)]
    fn arena_len(&self) -> usize {
        self.slots.lock().expect("guard arena poisoned").len()
    }
}

/// RAII permit; released on every exit path, including panics.
#[derive(Debug)]
pub struct GuardPermit {
    record_id: u64,
    arena: Arc<AnalysisGuard>,
    lock: Option<OwnedMutexGuard<()>>,
}

impl GuardPermit {
    pub fn record_id(&self) -> u64 {
        self.record_id
    }
}

impl Drop for GuardPermit {
    fn drop(&mut self) {
        // Release the lock first so waiters blocked on this slot wake up,
        // then evict the slot if nobody else references it.
        self.lock.take();
        let mut slots = self.arena.slots.lock().expect("guard arena poisoned");
        if let Some(slot) = slots.get(&self.record_id) {
            if Arc::strong_count(slot) == 1 {
                slots.remove(&self.record_id);
            }
        }
    }
}
