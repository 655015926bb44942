//! Cache Client Statistics
//!
//! Lock-free counters for every branch the cache client can take.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cache statistics collector
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    null_hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    loader_calls: AtomicU64,
    null_writes: AtomicU64,
    stale_served: AtomicU64,
    lock_waits: AtomicU64,
    rebuilds_scheduled: AtomicU64,
    rebuilds_completed: AtomicU64,
    rebuild_failures: AtomicU64,
    caller_runs: AtomicU64,
}

/// Point-in-time copy of `CacheStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub null_hits: u64,
    pub misses: u64,
    /// Misses answered by a concurrent loader call for the same key
    pub coalesced: u64,
    pub loader_calls: u64,
    pub null_writes: u64,
    pub stale_served: u64,
    /// Backoff sleeps in the mutex strategy
    pub lock_waits: u64,
    pub rebuilds_scheduled: u64,
    pub rebuilds_completed: u64,
    pub rebuild_failures: u64,
    /// Rebuilds run by the triggering task because the pool was saturated
    pub caller_runs: u64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_null_hit(&self) {
        self.null_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_loader_call(&self) {
        self.loader_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_null_write(&self) {
        self.null_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_wait(&self) {
        self.lock_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild_scheduled(&self) {
        self.rebuilds_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild_completed(&self) {
        self.rebuilds_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild_failure(&self) {
        self.rebuild_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_caller_runs(&self) {
        self.caller_runs.fetch_add(1, Ordering::Relaxed);
    }

    /// Hit ratio over all lookups, counting null hits as hits
    pub fn hit_ratio(&self) -> f64 {
        let s = self.snapshot();
        let hits = (s.hits + s.null_hits + s.stale_served) as f64;
        let total = hits + s.misses as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            null_hits: self.null_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            loader_calls: self.loader_calls.load(Ordering::Relaxed),
            null_writes: self.null_writes.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            lock_waits: self.lock_waits.load(Ordering::Relaxed),
            rebuilds_scheduled: self.rebuilds_scheduled.load(Ordering::Relaxed),
            rebuilds_completed: self.rebuilds_completed.load(Ordering::Relaxed),
            rebuild_failures: self.rebuild_failures.load(Ordering::Relaxed),
            caller_runs: self.caller_runs.load(Ordering::Relaxed),
        }
    }
}
