//! Cache-Aside Client
//!
//! Reads go to the shared store first and fall back to a caller-supplied
//! [`Loader`](crate::domain::Loader) on a miss.
//!
//! ```text
//!                    ┌──────────────┐   hit / null marker
//!   query ────────▶  │ KeyValueStore│ ───────────────────▶ caller
//!                    └──────┬───────┘
//!                           │ miss / logically expired
//!                           ▼
//!              ┌─────────────────────────┐
//!              │ KeyedMutex (per process)│  pass-through coalescing
//!              │ DistributedLock         │  mutex / logical rebuild
//!              └───────────┬─────────────┘
//!                          ▼
//!                  ┌───────────────┐     ┌─────────────┐
//!                  │    Loader     │ ◀── │ RebuildPool │ (logical only)
//!                  └───────────────┘     └─────────────┘
//! ```

mod client;
mod entry;
mod pool;
mod stats;

pub use client::{CacheClient, CacheClientConfig};
pub use entry::{cache_key, BareLookup, LogicalEntry, NULL_MARKER};
pub use pool::{RebuildJob, RebuildPool, Submission};
pub use stats::{CacheStats, CacheStatsSnapshot};
