//! Cache Client - cache-aside over a shared key-value store
//!
//! Three read strategies over the same `{prefix}{id}` key space:
//!
//! ```text
//!   query_with_pass_through     bare entry + null marker     (penetration)
//!   query_with_logical_expire   wrapped entry + async rebuild (breakdown)
//!   query_with_mutex            bare entry + rebuild lock     (breakdown)
//! ```
//!
//! Writes: `set` (bare, hard TTL), `set_with_logical_expire` (wrapped, no
//! TTL, used to pre-warm hot keys) and `invalidate` (after the owning
//! record changes).

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};

use super::entry::{cache_key, decode_bare, decode_logical, BareLookup, LogicalEntry, NULL_MARKER};
use super::pool::{RebuildPool, Submission};
use super::stats::{CacheStats, CacheStatsSnapshot};
use crate::domain::ports::{KeyValueStore, Loader};
use crate::error::{Error, Result};
use crate::lock::{DistributedLock, KeyedMutex, RetryPolicy};

// =============================================================================
// Configuration
// =============================================================================

/// Cache client configuration
#[derive(Debug, Clone)]
pub struct CacheClientConfig {
    /// Hard TTL of the negative-cache marker
    pub null_ttl: Duration,
    /// TTL of rebuild locks; bounds how long a crashed rebuild blocks others
    pub rebuild_lock_ttl: Duration,
    /// Background rebuild workers
    pub rebuild_workers: usize,
    /// Rebuild jobs that may wait for a worker before callers run them
    pub rebuild_queue_capacity: usize,
    /// Retry policy of the mutex strategy
    pub mutex_retry: RetryPolicy,
}

impl Default for CacheClientConfig {
    fn default() -> Self {
        Self {
            null_ttl: Duration::from_secs(2 * 60),
            rebuild_lock_ttl: Duration::from_secs(10),
            rebuild_workers: 10,
            rebuild_queue_capacity: 256,
            mutex_retry: RetryPolicy::default(),
        }
    }
}

// =============================================================================
// Cache Client
// =============================================================================

struct Inner {
    store: Arc<dyn KeyValueStore>,
    config: CacheClientConfig,
    pool: RebuildPool,
    stats: CacheStats,
    /// Coalesces concurrent misses on one key inside this process
    misses: KeyedMutex<String>,
}

/// Cache-aside client; cheap to clone
#[derive(Clone)]
pub struct CacheClient {
    inner: Arc<Inner>,
}

impl CacheClient {
    /// Create a client with default configuration. Needs a tokio runtime.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        Self::with_config(store, CacheClientConfig::default())
    }

    /// Create a client with custom configuration. Needs a tokio runtime.
    pub fn with_config(store: Arc<dyn KeyValueStore>, config: CacheClientConfig) -> Result<Self> {
        let pool = RebuildPool::new(config.rebuild_workers, config.rebuild_queue_capacity)?;
        debug!(
            workers = pool.workers(),
            queue = pool.queue_capacity(),
            "Rebuild pool started"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                config,
                pool,
                stats: CacheStats::new(),
                misses: KeyedMutex::new(),
            }),
        })
    }

    pub fn config(&self) -> &CacheClientConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn hit_ratio(&self) -> f64 {
        self.inner.stats.hit_ratio()
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Write `value` as a bare entry with a hard TTL.
    pub async fn set<R: Serialize + ?Sized>(&self, key: &str, value: &R, ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.inner.store.set(key, &json, Some(ttl)).await
    }

    /// Write `value` as a wrapped entry expiring logically after `ttl`.
    pub async fn set_with_logical_expire<R: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &R,
        ttl: Duration,
    ) -> Result<()> {
        let json = encode_logical(value, ttl)?;
        self.inner.store.set(key, &json, None).await
    }

    /// Drop the cached entry for `(key_prefix, id)`.
    ///
    /// Call after the backing record was updated; the next read repopulates.
    pub async fn invalidate(&self, key_prefix: &str, id: impl Display) -> Result<bool> {
        let key = cache_key(key_prefix, id);
        debug!(key = %key, "Invalidating cache entry");
        self.inner.store.delete(&key).await
    }

    // -------------------------------------------------------------------------
    // Pass-through (null-object caching)
    // -------------------------------------------------------------------------

    /// Read through the cache, caching misses as an empty marker.
    ///
    /// `Ok(None)` means the record does not exist (possibly answered from
    /// the negative cache without calling `loader`).
    pub async fn query_with_pass_through<I, R, L>(
        &self,
        key_prefix: &str,
        id: I,
        loader: &L,
        ttl: Duration,
    ) -> Result<Option<R>>
    where
        I: Display,
        R: Serialize + DeserializeOwned,
        L: Loader<I, R> + ?Sized,
    {
        let key = cache_key(key_prefix, &id);
        if let Some(answer) = self.cached_answer::<R>(&key).await? {
            return Ok(answer);
        }

        let _slot = self.inner.misses.lock(key.clone()).await;
        if let Some(answer) = self.read_bare::<R>(&key).await?.into_answer() {
            self.inner.stats.record_coalesced();
            return Ok(answer);
        }

        self.inner.stats.record_miss();
        self.load_and_fill(&key, &id, loader, ttl).await
    }

    // -------------------------------------------------------------------------
    // Mutex rebuild
    // -------------------------------------------------------------------------

    /// Read through the cache; only the rebuild-lock holder calls `loader`.
    ///
    /// Tasks that lose the lock sleep and retry the whole lookup. Running out
    /// of attempts is reported as `Error::LockContention`.
    pub async fn query_with_mutex<I, R, L>(
        &self,
        key_prefix: &str,
        id: I,
        loader: &L,
        ttl: Duration,
    ) -> Result<Option<R>>
    where
        I: Display,
        R: Serialize + DeserializeOwned,
        L: Loader<I, R> + ?Sized,
    {
        let key = cache_key(key_prefix, &id);
        let lock = DistributedLock::new(Arc::clone(&self.inner.store), key.clone());
        let policy = self.inner.config.mutex_retry;

        for attempt in 1..=policy.max_attempts {
            if let Some(answer) = self.cached_answer::<R>(&key).await? {
                return Ok(answer);
            }

            if lock.try_lock(self.inner.config.rebuild_lock_ttl).await? {
                return lock
                    .run_locked(async {
                        // Another holder may have filled it while we waited
                        if let Some(answer) = self.read_bare::<R>(&key).await?.into_answer() {
                            self.inner.stats.record_coalesced();
                            return Ok(answer);
                        }
                        self.inner.stats.record_miss();
                        self.load_and_fill(&key, &id, loader, ttl).await
                    })
                    .await;
            }

            self.inner.stats.record_lock_wait();
            debug!(key = %key, attempt, "Rebuild lock busy, backing off");
            tokio::time::sleep(policy.backoff).await;
        }

        Err(Error::LockContention {
            name: lock.name().to_string(),
            attempts: policy.max_attempts,
        })
    }

    // -------------------------------------------------------------------------
    // Logical expiration
    // -------------------------------------------------------------------------

    /// Serve a pre-warmed wrapped entry, refreshing it in the background once
    /// it is logically expired.
    ///
    /// Never calls `loader` on the caller's path (except under caller-runs
    /// backpressure). An absent key is `Ok(None)`: hot keys must be warmed
    /// with `set_with_logical_expire`. A stale payload is returned while at
    /// most one rebuild per key runs.
    pub async fn query_with_logical_expire<I, R, L>(
        &self,
        key_prefix: &str,
        id: I,
        loader: Arc<L>,
        ttl: Duration,
    ) -> Result<Option<R>>
    where
        I: Display + Send + Sync + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
        L: Loader<I, R> + ?Sized + 'static,
    {
        let key = cache_key(key_prefix, &id);
        let raw = self.inner.store.get(&key).await?;
        let Some(entry) = decode_logical::<R>(&key, raw)? else {
            self.inner.stats.record_miss();
            debug!(key = %key, "Logical cache miss");
            return Ok(None);
        };

        if !entry.is_expired_at(Utc::now()) {
            self.inner.stats.record_hit();
            return Ok(Some(entry.data));
        }

        let lock = DistributedLock::new(Arc::clone(&self.inner.store), key.clone());
        if !lock.try_lock(self.inner.config.rebuild_lock_ttl).await? {
            debug!(key = %key, "Rebuild already in flight, serving stale");
            self.inner.stats.record_stale_served();
            return Ok(Some(entry.data));
        }

        // A rebuild may have finished between our read and our acquisition
        let current = match self.inner.store.get(&key).await {
            Ok(raw) => decode_logical::<R>(&key, raw),
            Err(e) => Err(e),
        };
        match current {
            Ok(Some(fresh)) if !fresh.is_expired_at(Utc::now()) => {
                release(&lock).await;
                self.inner.stats.record_hit();
                return Ok(Some(fresh.data));
            }
            Ok(_) => {}
            Err(e) => {
                release(&lock).await;
                return Err(e);
            }
        }

        self.inner.stats.record_rebuild_scheduled();
        let job =
            rebuild_job::<I, R, L>(Arc::clone(&self.inner), lock, key.clone(), id, loader, ttl);
        if self.inner.pool.submit(job).await == Submission::RanInline {
            self.inner.stats.record_caller_runs();
        }

        self.inner.stats.record_stale_served();
        Ok(Some(entry.data))
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn read_bare<R: DeserializeOwned>(&self, key: &str) -> Result<BareLookup<R>> {
        let raw = self.inner.store.get(key).await?;
        decode_bare(key, raw)
    }

    /// `Some(answer)` when the cache alone answers the lookup.
    async fn cached_answer<R: DeserializeOwned>(&self, key: &str) -> Result<Option<Option<R>>> {
        let lookup = self.read_bare::<R>(key).await?;
        match &lookup {
            BareLookup::Hit(_) => self.inner.stats.record_hit(),
            BareLookup::NullHit => self.inner.stats.record_null_hit(),
            BareLookup::Miss => {}
        }
        Ok(lookup.into_answer())
    }

    async fn load_and_fill<I, R, L>(
        &self,
        key: &str,
        id: &I,
        loader: &L,
        ttl: Duration,
    ) -> Result<Option<R>>
    where
        R: Serialize,
        L: Loader<I, R> + ?Sized,
    {
        self.inner.stats.record_loader_call();
        match loader.load(id).await? {
            Some(value) => {
                let json = serde_json::to_string(&value)?;
                self.inner.store.set(key, &json, Some(ttl)).await?;
                debug!(key = %key, "Cache filled from loader");
                Ok(Some(value))
            }
            None => {
                self.inner
                    .store
                    .set(key, NULL_MARKER, Some(self.inner.config.null_ttl))
                    .await?;
                self.inner.stats.record_null_write();
                debug!(key = %key, "Loader found nothing, cached null marker");
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient")
            .field("config", &self.inner.config)
            .field("stats", &self.inner.stats.snapshot())
            .finish()
    }
}

fn encode_logical<R: Serialize + ?Sized>(value: &R, ttl: Duration) -> Result<String> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| Error::Config(format!("logical TTL out of range: {}", e)))?;
    let entry = LogicalEntry::new(value, Utc::now() + ttl);
    Ok(serde_json::to_string(&entry)?)
}

async fn release(lock: &DistributedLock) {
    if let Err(e) = lock.unlock().await {
        warn!(lock = %lock.key(), error = %e, "Rebuild lock release failed");
    }
}

/// Background refresh of one wrapped entry. Holds `lock` until it finishes.
fn rebuild_job<I, R, L>(
    inner: Arc<Inner>,
    lock: DistributedLock,
    key: String,
    id: I,
    loader: Arc<L>,
    ttl: Duration,
) -> futures::future::BoxFuture<'static, ()>
where
    I: Display + Send + Sync + 'static,
    R: Serialize + Send + 'static,
    L: Loader<I, R> + ?Sized + 'static,
{
    async move {
        let refreshed = lock
            .run_locked(async {
                inner.stats.record_loader_call();
                match loader.load(&id).await? {
                    Some(value) => {
                        let json = encode_logical(&value, ttl)?;
                        inner.store.set(&key, &json, None).await
                    }
                    None => inner.store.delete(&key).await.map(|_| ()),
                }
            })
            .await;

        match refreshed {
            Ok(()) => {
                inner.stats.record_rebuild_completed();
                debug!(key = %key, "Cache rebuilt");
            }
            Err(e) => {
                inner.stats.record_rebuild_failure();
                let failure = Error::RebuildFailed {
                    key: key.clone(),
                    reason: e.to_string(),
                };
                error!(error = %failure, "Cache rebuild failed");
            }
        }
    }
    .boxed()
}

// =============================================================================
// Tests
// =============================================================================
