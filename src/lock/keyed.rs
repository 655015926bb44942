//! In-Process Keyed Mutex
//!
//! One async mutex per key, created on first use and dropped once nobody
//! holds or waits for it. Only serializes tasks inside this process; it is a
//! fast path placed in front of `DistributedLock`, never a replacement.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Map of per-key async mutexes
#[derive(Debug)]
pub struct KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    slots: DashMap<K, Arc<Mutex<()>>>,
}

impl<K> Default for KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }
}

impl<K> KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: K) -> KeyedGuard<'_, K> {
        // Clone the slot under the shard lock so removal cannot race with us
        let slot = Arc::clone(self.slots.entry(key.clone()).or_default().value());
        let guard = slot.lock_owned().await;
        KeyedGuard {
            owner: self,
            key,
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or waited on
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Exclusive access to one key; released on drop.
#[derive(Debug)]
pub struct KeyedGuard<'a, K>
where
    K: Eq + Hash + Clone,
{
    owner: &'a KeyedMutex<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K> Drop for KeyedGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map itself still references the slot: nobody waits on it
        self.owner
            .slots
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}
