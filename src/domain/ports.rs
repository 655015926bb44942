//! Domain Ports (Port/Adapter Pattern)
//!
//! This module defines the abstractions the coordination core depends on.
//! Infrastructure adapters implement these traits; the core never talks to
//! Redis or a database directly.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Coordination Core                       │
//! │   CacheClient │ DistributedLock │ IdGenerator │ Seckill      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Ports (this module)                       │
//! │     KeyValueStore │ Loader │ VoucherStore/OrderTransaction   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │   InMemoryKeyValueStore │ RedisKeyValueStore │ VoucherStore  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Authenticated user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Seckill voucher identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VoucherId(pub u64);

impl std::fmt::Display for VoucherId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Seconds since the Unix epoch of the id generator's own epoch
/// (2023-02-20T00:00:00Z).
pub const ID_EPOCH_SECONDS: i64 = 1_676_822_400;

/// Number of low bits holding the daily sequence.
pub const SEQUENCE_BITS: u32 = 32;

/// Globally unique 64-bit identifier.
///
/// Layout: `sign (1, always 0) | seconds since ID_EPOCH (31) | sequence (32)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeneratedId(pub i64);

impl GeneratedId {
    /// Compose an id from its two fields.
    pub fn compose(relative_seconds: i64, sequence: i64) -> Self {
        Self((relative_seconds << SEQUENCE_BITS) | sequence)
    }

    /// Seconds since `ID_EPOCH_SECONDS` encoded in the high bits.
    pub fn timestamp_seconds(&self) -> i64 {
        self.0 >> SEQUENCE_BITS
    }

    /// Daily sequence encoded in the low bits.
    pub fn sequence(&self) -> u32 {
        (self.0 & u32::MAX as i64) as u32
    }

    /// Wall-clock second at which the id was minted.
    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(ID_EPOCH_SECONDS + self.timestamp_seconds(), 0)
            .single()
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for GeneratedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A time-boxed voucher with limited stock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeckillVoucher {
    pub voucher_id: VoucherId,
    /// Remaining stock. Only a hint when read outside a transaction.
    pub stock: i64,
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl SeckillVoucher {
    pub fn new(
        voucher_id: VoucherId,
        stock: i64,
        begin_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            voucher_id,
            stock,
            begin_time,
            end_time,
        }
    }

    /// True if `now` precedes the sale window.
    pub fn not_started_at(&self, now: DateTime<Utc>) -> bool {
        self.begin_time > now
    }

    /// True if `now` is past the sale window.
    pub fn ended_at(&self, now: DateTime<Utc>) -> bool {
        self.end_time < now
    }
}

/// One successful reservation. Never updated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherOrder {
    pub id: GeneratedId,
    pub user_id: UserId,
    pub voucher_id: VoucherId,
    pub created_at: DateTime<Utc>,
}

/// Per-request context carrying the authenticated caller.
///
/// Built by whatever authenticates the request and passed down explicitly;
/// it lives exactly as long as the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: UserId,
}

impl RequestContext {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }
}

// =============================================================================
// Key-Value Store Port
// =============================================================================

/// Shared key-value store (Redis or equivalent).
///
/// Every operation is atomic on the server side. The store is the only
/// cross-process synchronization point of the core.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a string value. `None` means the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a string value, with a hard TTL when `ttl` is `Some`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Write only if the key is absent (`SET NX EX`). Returns true on write.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Atomically increment an integer counter, creating it at 0 first.
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Delete a key. Returns true if it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete `key` only if its value equals `expected`, in one round trip.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;
}

// =============================================================================
// Loader Port
// =============================================================================

/// "Load entity by id" callback used by the cache client.
///
/// Must be idempotent and safe to call concurrently, including from a
/// background rebuild task.
#[async_trait]
pub trait Loader<I, R>: Send + Sync {
    async fn load(&self, id: &I) -> Result<Option<R>>;
}

#[async_trait]
impl<I, R, F, Fut> Loader<I, R> for F
where
    I: Clone + Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<R>>> + Send + 'static,
{
    async fn load(&self, id: &I) -> Result<Option<R>> {
        (self)(id.clone()).await
    }
}

// =============================================================================
// Voucher Store Port
// =============================================================================

/// Collaborator that owns voucher and order persistence.
#[async_trait]
pub trait VoucherStore: Send + Sync {
    /// Read a voucher outside any transaction.
    async fn find_voucher(&self, voucher_id: VoucherId) -> Result<Option<SeckillVoucher>>;

    /// Open a transaction.
    async fn begin(&self) -> Result<Box<dyn OrderTransaction>>;
}

/// One durable transaction over stock and order rows.
///
/// Dropping a transaction without `commit` rolls it back.
#[async_trait]
pub trait OrderTransaction: Send {
    /// Number of committed orders for the pair.
    async fn count_orders(&mut self, user_id: UserId, voucher_id: VoucherId) -> Result<u64>;

    /// `UPDATE stock = stock - 1 WHERE voucher_id = ? AND stock > 0`.
    ///
    /// Returns false when zero rows were affected.
    async fn decrement_stock(&mut self, voucher_id: VoucherId) -> Result<bool>;

    /// Stage an order row.
    async fn insert_order(&mut self, order: &VoucherOrder) -> Result<()>;

    /// Make every staged change durable and visible.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every staged change.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_id_layout() {
        let id = GeneratedId::compose(1000, 7);
        assert_eq!(id.timestamp_seconds(), 1000);
        assert_eq!(id.sequence(), 7);
        assert!(id.as_i64() > 0);
        assert_eq!(id.as_i64(), (1000 << 32) | 7);
    }

    #[test]
    fn test_generated_id_issued_at() {
        let id = GeneratedId::compose(86_400, 1);
        let issued = id.issued_at().unwrap();
        assert_eq!(issued.timestamp(), ID_EPOCH_SECONDS + 86_400);
    }

    #[test]
    fn test_voucher_window() {
        let now = Utc::now();
        let voucher = SeckillVoucher::new(
            VoucherId(1),
            10,
            now - chrono::Duration::hours(1),
            now + chrono::Duration::hours(1),
        );
        assert!(!voucher.not_started_at(now));
        assert!(!voucher.ended_at(now));
        assert!(voucher.not_started_at(now - chrono::Duration::hours(2)));
        assert!(voucher.ended_at(now + chrono::Duration::hours(2)));
    }

    #[test]
    fn test_voucher_serializes_camel_case() {
        let now = Utc::now();
        let voucher = SeckillVoucher::new(VoucherId(3), 5, now, now);
        let json = serde_json::to_value(&voucher).unwrap();
        assert_eq!(json["voucherId"], 3);
        assert!(json.get("beginTime").is_some());
    }

    #[tokio::test]
    async fn test_closure_loader() {
        let loader = |id: u64| async move {
            Ok::<_, crate::error::Error>(if id == 1 { Some("one") } else { None })
        };
        assert_eq!(loader.load(&1).await.unwrap(), Some("one"));
        assert_eq!(loader.load(&2).await.unwrap(), None);
    }
}
