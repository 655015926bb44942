//! Locking Primitives
//!
//! - [`DistributedLock`] - cross-process mutual exclusion over a
//!   `KeyValueStore` (`SET NX EX` + scripted compare-and-delete)
//! - [`KeyedMutex`] - in-process per-key async mutex, used as a fast path
//!   in front of the distributed lock and to coalesce cache misses
//! - [`RetryPolicy`] - bounded fixed-backoff acquisition

mod distributed;
mod keyed;

pub use distributed::{DistributedLock, RetryPolicy, LOCK_KEY_PREFIX};
pub use keyed::{KeyedGuard, KeyedMutex};
