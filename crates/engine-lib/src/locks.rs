//! Per-machine mutual exclusion
//!
//! Drift evaluation and the start of a retrain run for the same machine
//! must not interleave; both take the machine's lock.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct MachineLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MachineLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and hold the lock of `machine_id`
    pub async fn lock(&self, machine_id: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(machine_id.to_string())
            .or_default()
            .clone();
        mutex.lock_owned().await
    }
}
