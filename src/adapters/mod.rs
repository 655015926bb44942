//! Infrastructure Adapters
//!
//! Adapter implementations for the domain ports, following the
//! Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │      KeyValueStore │ VoucherStore │ OrderTransaction        │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryKeyValueStore │ RedisKeyValueStore                  │ │
//! │  │ InMemoryVoucherStore                                        │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use flashsale::adapters::RedisKeyValueStore;
//! use flashsale::domain::ports::KeyValueStore;
//!
//! let store = RedisKeyValueStore::connect("redis://127.0.0.1:6379/0").await?;
//! let fresh = store.set_if_absent("lock:order:7", "token", ttl).await?;
//! ```

mod memory;
mod redis_store;
mod voucher_store;

pub use memory::{InMemoryKeyValueStore, KeyValueStats};
pub use redis_store::{RedisKeyValueStore, COMPARE_AND_DELETE_SCRIPT};
pub use voucher_store::InMemoryVoucherStore;
