//! Distributed Lock
//!
//! Mutual exclusion over a `KeyValueStore` key:
//!
//! - acquire: `SET lock:{name} {token} NX EX {ttl}`
//! - release: one server-side compare-and-delete of the holder's token
//!
//! The TTL is the crash-safety net. A holder whose TTL elapsed can no longer
//! release the lock, because its token no longer matches whatever is stored.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use once_cell::sync::Lazy;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::ports::KeyValueStore;
use crate::error::Result;

/// Key namespace for lock records
pub const LOCK_KEY_PREFIX: &str = "lock:";

/// Identity of this process, shared by every holder token it issues.
static PROCESS_TOKEN: Lazy<String> = Lazy::new(|| Uuid::new_v4().simple().to_string());

/// Distinguishes holders inside one process.
static HOLDER_SEQUENCE: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Retry Policy
// =============================================================================

/// Bounded fixed-backoff retry for lock acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Sleep between attempts
    pub backoff: Duration,
}

impl RetryPolicy {
    /// A single attempt, no retry.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            backoff: Duration::from_millis(50),
        }
    }
}

// =============================================================================
// Distributed Lock
// =============================================================================

/// A named lock held through a key-value store.
///
/// Each handle carries its own token, so two handles on the same name are
/// two different holders even inside one process.
pub struct DistributedLock {
    store: Arc<dyn KeyValueStore>,
    name: String,
    key: String,
    token: String,
}

impl DistributedLock {
    /// Create a handle for the lock `name`. Nothing is acquired yet.
    pub fn new(store: Arc<dyn KeyValueStore>, name: impl Into<String>) -> Self {
        let name = name.into();
        let key = format!("{}{}", LOCK_KEY_PREFIX, name);
        let token = format!(
            "{}-{}",
            *PROCESS_TOKEN,
            HOLDER_SEQUENCE.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            store,
            name,
            key,
            token,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store key of the lock record
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Holder token written on acquisition
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Single non-blocking acquisition attempt.
    ///
    /// `Ok(false)` means someone else holds the lock; it is not an error.
    pub async fn try_lock(&self, ttl: Duration) -> Result<bool> {
        let acquired = self.store.set_if_absent(&self.key, &self.token, ttl).await?;
        debug!(lock = %self.key, acquired, "Lock attempt");
        Ok(acquired)
    }

    /// Retry `try_lock` with a fixed backoff. `Ok(false)` once attempts run out.
    pub async fn lock_with_retry(&self, ttl: Duration, policy: RetryPolicy) -> Result<bool> {
        for attempt in 1..=policy.max_attempts {
            if self.try_lock(ttl).await? {
                return Ok(true);
            }
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.backoff).await;
            }
        }
        debug!(lock = %self.key, attempts = policy.max_attempts, "Lock retries exhausted");
        Ok(false)
    }

    /// Release the lock if this handle still holds it.
    ///
    /// Returns false when the stored token is not ours (expired and taken
    /// over, or never acquired); nothing is deleted in that case.
    pub async fn unlock(&self) -> Result<bool> {
        let released = self
            .store
            .compare_and_delete(&self.key, &self.token)
            .await?;
        debug!(lock = %self.key, released, "Lock release");
        Ok(released)
    }

    /// Run `body` while the lock is held, then release it.
    ///
    /// The caller must already hold the lock. Release happens on every exit
    /// path: success, error, or panic (the panic is resumed afterwards). A
    /// failed release is logged and left to the TTL.
    pub async fn run_locked<F, T>(&self, body: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let outcome = AssertUnwindSafe(body).catch_unwind().await;

        match self.unlock().await {
            Ok(true) => {}
            Ok(false) => warn!(lock = %self.key, "Lock expired before release"),
            Err(e) => warn!(lock = %self.key, error = %e, "Lock release failed, TTL will expire it"),
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryKeyValueStore;
    use crate::error::Error;

    fn store() -> Arc<dyn KeyValueStore> {
        Arc::new(InMemoryKeyValueStore::new())
    }

    #[test]
    fn test_tokens_are_unique_per_handle() {
        let kv = store();
        let a = DistributedLock::new(kv.clone(), "order:1");
        let b = DistributedLock::new(kv, "order:1");

        assert_eq!(a.key(), "lock:order:1");
        assert_ne!(a.token(), b.token());
        assert!(a.token().starts_with(PROCESS_TOKEN.as_str()));
    }

    #[tokio::test]
    async fn test_try_lock_and_unlock() {
        let kv = store();
        let lock = DistributedLock::new(kv.clone(), "shop:1");
        let ttl = Duration::from_secs(10);

        assert!(lock.try_lock(ttl).await.unwrap());
        assert!(!lock.try_lock(ttl).await.unwrap());
        assert_eq!(
            kv.get("lock:shop:1").await.unwrap().as_deref(),
            Some(lock.token())
        );

        assert!(lock.unlock().await.unwrap());
        assert!(!lock.unlock().await.unwrap());
        assert!(lock.try_lock(ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_foreign_unlock_is_noop() {
        let kv = store();
        let holder = DistributedLock::new(kv.clone(), "shop:1");
        let intruder = DistributedLock::new(kv.clone(), "shop:1");
        let ttl = Duration::from_secs(10);

        assert!(holder.try_lock(ttl).await.unwrap());
        assert!(!intruder.unlock().await.unwrap());

        // Still held by the original holder
        assert!(!intruder.try_lock(ttl).await.unwrap());
        assert_eq!(
            kv.get("lock:shop:1").await.unwrap().as_deref(),
            Some(holder.token())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_holder_cannot_release_new_holder() {
        let kv = store();
        let a = DistributedLock::new(kv.clone(), "job");
        let b = DistributedLock::new(kv.clone(), "job");

        assert!(a.try_lock(Duration::from_secs(1)).await.unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(b.try_lock(Duration::from_secs(10)).await.unwrap());
        assert!(!a.unlock().await.unwrap());
        assert_eq!(kv.get("lock:job").await.unwrap().as_deref(), Some(b.token()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_with_retry() {
        let kv = store();
        let holder = DistributedLock::new(kv.clone(), "order:9");
        let waiter = DistributedLock::new(kv.clone(), "order:9");

        assert!(holder.try_lock(Duration::from_secs(30)).await.unwrap());
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        assert!(!waiter
            .lock_with_retry(Duration::from_secs(30), policy)
            .await
            .unwrap());

        holder.unlock().await.unwrap();
        assert!(waiter
            .lock_with_retry(Duration::from_secs(30), policy)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_run_locked_releases_on_error() {
        let kv = store();
        let lock = DistributedLock::new(kv.clone(), "rebuild");
        assert!(lock.try_lock(Duration::from_secs(10)).await.unwrap());

        let result: Result<()> = lock
            .run_locked(async { Err(Error::Internal("boom".to_string())) })
            .await;

        assert!(result.is_err());
        assert_eq!(kv.get("lock:rebuild").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_run_locked_releases_on_panic() {
        let kv = store();
        let lock = Arc::new(DistributedLock::new(kv.clone(), "rebuild"));
        assert!(lock.try_lock(Duration::from_secs(10)).await.unwrap());

        let task_lock = Arc::clone(&lock);
        let joined = tokio::spawn(async move {
            task_lock
                .run_locked(async {
                    if true {
                        panic!("loader exploded");
                    }
                    Ok(())
                })
                .await
        })
        .await;

        assert!(joined.unwrap_err().is_panic());
        assert_eq!(kv.get("lock:rebuild").await.unwrap(), None);
    }

    #[test]
    fn test_retry_policy_floor() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
        assert_eq!(RetryPolicy::once().max_attempts, 1);
    }
}
