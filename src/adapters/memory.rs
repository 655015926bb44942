//! In-Memory Key-Value Store
//!
//! Implements the `KeyValueStore` port inside the process. Each key is
//! guarded by its DashMap shard, which gives the same per-key atomicity the
//! Redis commands give. Expired keys are removed lazily on access, and a
//! full sweep runs every `SWEEP_EVERY_WRITES` writes so keys that are never
//! read again (null markers, old day counters, abandoned locks) are reclaimed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::ports::KeyValueStore;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Writes between two full sweeps of expired keys
pub const SWEEP_EVERY_WRITES: u64 = 1024;

/// Store operation counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValueStats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

/// In-memory key-value store for tests and single-process deployments
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    data: DashMap<String, StoredValue>,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl InMemoryKeyValueStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining hard TTL of a key, `None` when absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.data
            .get(key)
            .and_then(|e| e.expires_at)
            .filter(|at| *at > now)
            .map(|at| at - now)
    }

    /// Operation counters
    pub fn stats(&self) -> KeyValueStats {
        KeyValueStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, v| !v.is_expired(now));
        before.saturating_sub(self.data.len())
    }

    /// Count a write and sweep on every `SWEEP_EVERY_WRITES`th one.
    /// Must be called before taking any entry reference.
    fn record_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY_WRITES == 0 {
            let removed = self.purge_expired();
            if removed > 0 {
                debug!(removed, "Swept expired keys");
            }
        }
    }

    fn purge_if_expired(&self, key: &str) {
        let now = Instant::now();
        self.data.remove_if(key, |_, v| v.is_expired(now));
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.purge_if_expired(key);
        Ok(self.data.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.record_write();
        self.data.insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.record_write();
        let now = Instant::now();
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(StoredValue::new(value, Some(ttl)));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        self.record_write();
        let now = Instant::now();
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| StoredValue::new("0", None));
        if entry.is_expired(now) {
            *entry = StoredValue::new("0", None);
        }
        let current: i64 = entry.value.parse().map_err(|_| {
            Error::store(format!("value at {} is not an integer", key))
        })?;
        let next = current
            .checked_add(1)
            .ok_or_else(|| Error::store(format!("increment would overflow at {}", key)))?;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        Ok(self
            .data
            .remove(key)
            .is_some_and(|(_, v)| !v.is_expired(now)))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        Ok(self
            .data
            .remove_if(key, |_, v| !v.is_expired(now) && v.value == expected)
            .is_some())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = InMemoryKeyValueStore::new();

        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = InMemoryKeyValueStore::new();

        store
            .set("k", "v", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(store.ttl("k").is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent() {
        let store = InMemoryKeyValueStore::new();
        let ttl = Duration::from_secs(10);

        assert!(store.set_if_absent("lock:a", "t1", ttl).await.unwrap());
        assert!(!store.set_if_absent("lock:a", "t2", ttl).await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap(), Some("t1".to_string()));

        // An expired holder no longer blocks acquisition
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.set_if_absent("lock:a", "t2", ttl).await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap(), Some("t2".to_string()));
    }

    #[tokio::test]
    async fn test_increment() {
        let store = InMemoryKeyValueStore::new();

        assert_eq!(store.increment("icr:order").await.unwrap(), 1);
        assert_eq!(store.increment("icr:order").await.unwrap(), 2);

        store.set("text", "abc", None).await.unwrap();
        assert!(store.increment("text").await.is_err());
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let store = InMemoryKeyValueStore::new();
        store
            .set("lock:a", "owner", Some(Duration::from_secs(10)))
            .await
            .unwrap();

        assert!(!store.compare_and_delete("lock:a", "intruder").await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap(), Some("owner".to_string()));

        assert!(store.compare_and_delete("lock:a", "owner").await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = InMemoryKeyValueStore::new();
        for i in 0..100 {
            store
                .set(&format!("cache:shop:{}", i), "", Some(Duration::from_secs(120)))
                .await
                .unwrap();
        }
        store.set("persistent", "v", None).await.unwrap();

        tokio::time::advance(Duration::from_secs(121)).await;

        assert_eq!(store.purge_expired(), 100);
        assert_eq!(store.data.len(), 1);
        assert_eq!(store.get("persistent").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unread_expired_keys_are_swept_by_writes() {
        let store = InMemoryKeyValueStore::new();
        let count = SWEEP_EVERY_WRITES as usize;

        // Null markers for ids nobody asks about again
        for i in 0..count {
            store
                .set(&format!("cache:shop:{}", i), "", Some(Duration::from_secs(120)))
                .await
                .unwrap();
        }
        tokio::time::advance(Duration::from_secs(3600)).await;

        for i in 0..count {
            store.set(&format!("other:{}", i), "v", None).await.unwrap();
        }

        assert_eq!(store.data.len(), count);
        assert_eq!(store.len(), count);
    }

    #[tokio::test]
    async fn test_stats() {
        let store = InMemoryKeyValueStore::new();
        store.set("a", "1", None).await.unwrap();
        store.get("a").await.unwrap();
        store.delete("a").await.unwrap();

        assert_eq!(
            store.stats(),
            KeyValueStats {
                reads: 1,
                writes: 1,
                deletes: 1
            }
        );
    }
}
