//! Flashsale - Cache-Aside Caching and Seckill Ordering over a Shared Store
//!
//! Building blocks for high-concurrency read-heavy and flash-sale workloads
//! on top of Redis (or any store implementing [`KeyValueStore`]).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   CacheClient                       VoucherOrderService          │
//! │   pass-through │ logical │ mutex    validate → lock → reserve    │
//! │        │            │        │            │           │          │
//! │        ▼            ▼        ▼            ▼           ▼          │
//! │   RebuildPool   DistributedLock / KeyedMutex     IdGenerator     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │          KeyValueStore (Redis)          VoucherStore (SQL)       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - In-memory and Redis implementations of the ports
//! - [`cache`] - Cache-aside client with penetration/breakdown protection
//! - [`domain`] - Value objects and ports
//! - [`error`] - Error types
//! - [`id_generator`] - Time-ordered 64-bit ids
//! - [`lock`] - Distributed and in-process locks
//! - [`metrics`] - Prometheus text rendering of component counters
//! - [`seckill`] - Stock reservation protocol

pub mod adapters;
pub mod cache;
pub mod domain;
pub mod error;
pub mod id_generator;
pub mod lock;
pub mod metrics;
pub mod seckill;

// Re-export commonly used types
pub use adapters::{InMemoryKeyValueStore, InMemoryVoucherStore, RedisKeyValueStore};
pub use cache::{CacheClient, CacheClientConfig};
pub use domain::{GeneratedId, KeyValueStore, Loader, RequestContext, UserId, VoucherId};
pub use error::{Error, Result};
pub use id_generator::IdGenerator;
pub use lock::{DistributedLock, KeyedMutex, RetryPolicy};
pub use seckill::{Rejection, ReservationOutcome, SeckillConfig, VoucherOrderService};
