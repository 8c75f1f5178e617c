//! Per-Service mutual exclusion
//!
//! The event-driven controller and the periodic drift pass both mutate
//! router rules. Each takes the Service's lock from router snapshot through
//! execution, so the two can never interleave on the same Service.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::rules::ServiceKey;

pub type KeyGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<ServiceKey, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &ServiceKey) -> Arc<AsyncMutex<()>> {
        self.locks.lock().entry(key.clone()).or_default().clone()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &ServiceKey) -> KeyGuard {
        self.slot(key).lock_owned().await
    }

    /// Exclusive access to `key` if nobody holds it
    pub fn try_lock(&self, key: &ServiceKey) -> Option<KeyGuard> {
        self.slot(key).try_lock_owned().ok()
    }

    /// Drop slots that are neither held nor awaited
    pub fn prune(&self) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, slot| Arc::strong_count(slot) > 1);
        before - locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}
