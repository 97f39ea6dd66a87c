//! Per-lab exclusive sections.
//!
//! At most one provision-or-teardown operation may run per lab. The table
//! only holds entries for labs with an operation in flight: a [`LabGuard`]
//! inserts its lab on acquisition and removes it on drop, so the table never
//! grows beyond the number of concurrent operations. A guard dropped by a
//! cancelled task releases the lab like a completed one.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::lab::LabId;

/// Table of labs with an operation in flight.
#[derive(Debug, Default, Clone)]
pub struct LabLocks {
    held: Arc<Mutex<HashSet<LabId>>>,
}

impl LabLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the exclusive section for `lab_id`.
    ///
    /// Fails with [`Error::LabBusy`] if another operation holds it; callers
    /// are rejected, never queued.
    pub fn try_acquire(&self, lab_id: LabId) -> Result<LabGuard> {
        let mut held = self.held.lock();
        if !held.insert(lab_id) {
            return Err(Error::LabBusy(lab_id));
        }
        Ok(LabGuard {
            lab_id,
            held: Arc::clone(&self.held),
        })
    }

    /// Whether an operation currently holds `lab_id`.
    pub fn is_held(&self, lab_id: LabId) -> bool {
        self.held.lock().contains(&lab_id)
    }

    /// Number of labs with an operation in flight.
    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    /// Whether no lab is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Proof of exclusive access to one lab. Releases on drop.
#[derive(Debug)]
pub struct LabGuard {
    lab_id: LabId,
    held: Arc<Mutex<HashSet<LabId>>>,
}

impl LabGuard {
    /// The guarded lab.
    pub fn lab_id(&self) -> LabId {
        self.lab_id
    }
}

impl Drop for LabGuard {
    fn drop(&mut self) {
        self.held.lock().remove(&self.lab_id);
    }
}
