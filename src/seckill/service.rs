//! Voucher Order Service
//!
//! Reserves one unit of a seckill voucher per user.
//!
//! # Safety Guarantees
//!
//! 1. Stock never goes negative: every write is the conditional decrement
//! 2. At most one committed order per (user, voucher): the idempotency check
//!    and the insert run under the per-user lock
//! 3. The per-user lock is released only after the transaction commits or
//!    rolls back, on every exit path

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use super::protocol::{Rejection, ReservationOutcome, ReservationState, ReservationTrace};
use crate::domain::ports::{
    KeyValueStore, RequestContext, UserId, VoucherId, VoucherOrder, VoucherStore,
};
use crate::error::Result;
use crate::id_generator::IdGenerator;
use crate::lock::{DistributedLock, KeyedMutex, RetryPolicy};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the voucher order service
#[derive(Debug, Clone)]
pub struct SeckillConfig {
    /// TTL of the per-user lock; well above transaction latency
    pub user_lock_ttl: Duration,

    /// Acquisition policy of the per-user lock
    pub lock_retry: RetryPolicy,

    /// Business prefix of order ids
    pub order_id_prefix: String,

    /// Queue same-user attempts on an in-process mutex first
    pub in_process_fast_path: bool,

    /// Finished attempts kept for `recent_reservations`
    pub history_limit: usize,
}

impl Default for SeckillConfig {
    fn default() -> Self {
        Self {
            user_lock_ttl: Duration::from_secs(30),
            lock_retry: RetryPolicy::new(50, Duration::from_millis(20)),
            order_id_prefix: "order".to_string(),
            in_process_fast_path: true,
            history_limit: 128,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Reservation counters
#[derive(Debug, Default)]
pub struct ReservationStats {
    attempts: AtomicU64,
    committed: AtomicU64,
    voucher_not_found: AtomicU64,
    not_started: AtomicU64,
    ended: AtomicU64,
    insufficient_stock: AtomicU64,
    already_ordered: AtomicU64,
    lock_contention: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of `ReservationStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservationStatsSnapshot {
    pub attempts: u64,
    pub committed: u64,
    pub voucher_not_found: u64,
    pub not_started: u64,
    pub ended: u64,
    pub insufficient_stock: u64,
    pub already_ordered: u64,
    pub lock_contention: u64,
    /// Attempts aborted by an infrastructure error
    pub failures: u64,
}

impl ReservationStats {
    fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_outcome(&self, outcome: &ReservationOutcome) {
        let counter = match outcome {
            ReservationOutcome::Committed(_) => &self.committed,
            ReservationOutcome::Rejected(reason) => self.rejection_counter(*reason),
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn rejection_counter(&self, reason: Rejection) -> &AtomicU64 {
        match reason {
            Rejection::VoucherNotFound => &self.voucher_not_found,
            Rejection::NotStarted => &self.not_started,
            Rejection::Ended => &self.ended,
            Rejection::InsufficientStock => &self.insufficient_stock,
            Rejection::AlreadyOrdered => &self.already_ordered,
            Rejection::LockContention => &self.lock_contention,
        }
    }

    pub fn snapshot(&self) -> ReservationStatsSnapshot {
        ReservationStatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            voucher_not_found: self.voucher_not_found.load(Ordering::Relaxed),
            not_started: self.not_started.load(Ordering::Relaxed),
            ended: self.ended.load(Ordering::Relaxed),
            insufficient_stock: self.insufficient_stock.load(Ordering::Relaxed),
            already_ordered: self.already_ordered.load(Ordering::Relaxed),
            lock_contention: self.lock_contention.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl ReservationStatsSnapshot {
    /// Count of one rejection kind
    pub fn rejected(&self, reason: Rejection) -> u64 {
        match reason {
            Rejection::VoucherNotFound => self.voucher_not_found,
            Rejection::NotStarted => self.not_started,
            Rejection::Ended => self.ended,
            Rejection::InsufficientStock => self.insufficient_stock,
            Rejection::AlreadyOrdered => self.already_ordered,
            Rejection::LockContention => self.lock_contention,
        }
    }
}

// =============================================================================
// Voucher Order Service
// =============================================================================

/// Runs the stock reservation protocol
pub struct VoucherOrderService {
    store: Arc<dyn VoucherStore>,
    kv: Arc<dyn KeyValueStore>,
    ids: IdGenerator,
    /// In-process fast path in front of the per-user distributed lock
    user_locks: KeyedMutex<UserId>,
    config: SeckillConfig,
    stats: ReservationStats,
    history: Mutex<VecDeque<ReservationTrace>>,
}

impl VoucherOrderService {
    /// Create a service with default configuration
    pub fn new(store: Arc<dyn VoucherStore>, kv: Arc<dyn KeyValueStore>) -> Self {
        Self::with_config(store, kv, SeckillConfig::default())
    }

    /// Create a service with custom configuration
    pub fn with_config(
        store: Arc<dyn VoucherStore>,
        kv: Arc<dyn KeyValueStore>,
        config: SeckillConfig,
    ) -> Self {
        Self {
            store,
            ids: IdGenerator::new(Arc::clone(&kv)),
            kv,
            user_locks: KeyedMutex::new(),
            config,
            stats: ReservationStats::default(),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &SeckillConfig {
        &self.config
    }

    pub fn stats(&self) -> ReservationStatsSnapshot {
        self.stats.snapshot()
    }

    /// Most recent finished attempts, oldest first
    pub fn recent_reservations(&self) -> Vec<ReservationTrace> {
        self.history.lock().iter().cloned().collect()
    }

    /// Name of the per-user lock (`lock:` is prepended by the lock itself)
    pub fn user_lock_name(user_id: UserId) -> String {
        format!("order:{}", user_id)
    }

    /// Try to reserve one unit of `voucher_id` for the caller in `ctx`.
    ///
    /// Business refusals come back as `Ok(ReservationOutcome::Rejected(..))`;
    /// `Err` is reserved for infrastructure failures.
    #[instrument(skip_all, fields(user = %ctx.user_id, voucher = %voucher_id))]
    pub async fn seckill_voucher(
        &self,
        ctx: &RequestContext,
        voucher_id: VoucherId,
    ) -> Result<ReservationOutcome> {
        self.stats.record_attempt();
        let mut trace = ReservationTrace::new(ctx.user_id, voucher_id);

        let result = self.reserve(ctx.user_id, voucher_id, &mut trace).await;

        match &result {
            Ok(outcome) => {
                self.stats.record_outcome(outcome);
                trace.finish(*outcome);
                if let ReservationOutcome::Rejected(reason) = outcome {
                    debug!(reason = reason.as_str(), "Reservation rejected");
                }
            }
            Err(e) => {
                self.stats.record_failure();
                trace.fail(&e.to_string());
                warn!(error = %e, "Reservation failed");
            }
        }
        self.remember(trace);

        result
    }

    async fn reserve(
        &self,
        user_id: UserId,
        voucher_id: VoucherId,
        trace: &mut ReservationTrace,
    ) -> Result<ReservationOutcome> {
        let Some(voucher) = self.store.find_voucher(voucher_id).await? else {
            return Ok(Rejection::VoucherNotFound.into());
        };

        let now = Utc::now();
        if voucher.not_started_at(now) {
            return Ok(Rejection::NotStarted.into());
        }
        if voucher.ended_at(now) {
            return Ok(Rejection::Ended.into());
        }
        // Only a hint; the conditional decrement decides
        if voucher.stock < 1 {
            return Ok(Rejection::InsufficientStock.into());
        }

        trace.transition(ReservationState::Serializing);
        let _local = if self.config.in_process_fast_path {
            Some(self.user_locks.lock(user_id).await)
        } else {
            None
        };

        let lock = DistributedLock::new(Arc::clone(&self.kv), Self::user_lock_name(user_id));
        if !lock
            .lock_with_retry(self.config.user_lock_ttl, self.config.lock_retry)
            .await?
        {
            warn!(lock = %lock.key(), "Per-user lock stayed busy");
            return Ok(Rejection::LockContention.into());
        }

        lock.run_locked(self.create_voucher_order(user_id, voucher_id, trace))
            .await
    }

    /// The locked region: idempotency check, decrement, mint, insert, commit.
    ///
    /// Any early return or error drops the transaction, which rolls it back
    /// before the caller releases the lock.
    async fn create_voucher_order(
        &self,
        user_id: UserId,
        voucher_id: VoucherId,
        trace: &mut ReservationTrace,
    ) -> Result<ReservationOutcome> {
        trace.transition(ReservationState::ReservingStock);
        let mut tx = self.store.begin().await?;

        if tx.count_orders(user_id, voucher_id).await? > 0 {
            tx.rollback().await?;
            return Ok(Rejection::AlreadyOrdered.into());
        }

        if !tx.decrement_stock(voucher_id).await? {
            tx.rollback().await?;
            return Ok(Rejection::InsufficientStock.into());
        }

        trace.transition(ReservationState::Minting);
        let order_id = self.ids.next_id(&self.config.order_id_prefix).await?;
        let order = VoucherOrder {
            id: order_id,
            user_id,
            voucher_id,
            created_at: Utc::now(),
        };
        tx.insert_order(&order).await?;
        tx.commit().await?;

        info!(order = %order_id, "Voucher order committed");
        Ok(ReservationOutcome::Committed(order_id))
    }

    fn remember(&self, trace: ReservationTrace) {
        if self.config.history_limit == 0 {
            return;
        }
        let mut history = self.history.lock();
        while history.len() >= self.config.history_limit {
            history.pop_front();
        }
        history.push_back(trace);
    }
}

impl std::fmt::Debug for VoucherOrderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoucherOrderService")
            .field("config", &self.config)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryKeyValueStore, InMemoryVoucherStore};
    use crate::domain::ports::{OrderTransaction, SeckillVoucher};
    use crate::error::Error;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    const VOUCHER: VoucherId = VoucherId(10);

    fn open_voucher(stock: i64) -> SeckillVoucher {
        let now = Utc::now();
        SeckillVoucher::new(
            VOUCHER,
            stock,
            now - ChronoDuration::hours(1),
            now + ChronoDuration::hours(1),
        )
    }

    fn setup(
        voucher: SeckillVoucher,
    ) -> (InMemoryVoucherStore, Arc<InMemoryKeyValueStore>, VoucherOrderService) {
        let store = InMemoryVoucherStore::new();
        store.put_voucher(voucher);
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let service = VoucherOrderService::new(Arc::new(store.clone()), kv.clone());
        (store, kv, service)
    }

    fn ctx(user: u64) -> RequestContext {
        RequestContext::new(UserId(user))
    }

    #[tokio::test]
    async fn test_commits_one_order() {
        let (store, kv, service) = setup(open_voucher(5));

        let outcome = service.seckill_voucher(&ctx(7), VOUCHER).await.unwrap();

        let order_id = assert_matches!(outcome, ReservationOutcome::Committed(id) => id);
        assert_eq!(store.stock(VOUCHER), Some(4));
        let orders = store.orders_for(VOUCHER);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].id, order_id);
        assert_eq!(orders[0].user_id, UserId(7));
        assert_eq!(kv.get("lock:order:7").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_second_attempt_is_already_ordered() {
        let (store, _kv, service) = setup(open_voucher(5));

        let first = service.seckill_voucher(&ctx(7), VOUCHER).await.unwrap();
        let second = service.seckill_voucher(&ctx(7), VOUCHER).await.unwrap();

        assert!(first.is_committed());
        assert_eq!(second, ReservationOutcome::Rejected(Rejection::AlreadyOrdered));
        assert_eq!(store.stock(VOUCHER), Some(4));
    }

    #[tokio::test]
    async fn test_validation_rejections() {
        let now = Utc::now();
        let (store, _kv, service) = setup(open_voucher(0));
        store.put_voucher(SeckillVoucher::new(
            VoucherId(11),
            5,
            now + ChronoDuration::hours(1),
            now + ChronoDuration::hours(2),
        ));
        store.put_voucher(SeckillVoucher::new(
            VoucherId(12),
            5,
            now - ChronoDuration::hours(2),
            now - ChronoDuration::hours(1),
        ));

        let cases = [
            (VoucherId(99), Rejection::VoucherNotFound),
            (VoucherId(11), Rejection::NotStarted),
            (VoucherId(12), Rejection::Ended),
            (VOUCHER, Rejection::InsufficientStock),
        ];
        for (voucher_id, expected) in cases {
            let outcome = service.seckill_voucher(&ctx(1), voucher_id).await.unwrap();
            assert_eq!(outcome.rejection(), Some(expected), "voucher {}", voucher_id);
        }

        let stats = service.stats();
        assert_eq!(stats.attempts, 4);
        for (_, expected) in cases {
            assert_eq!(stats.rejected(expected), 1);
        }
        assert!(store.orders().is_empty());
    }

    #[tokio::test]
    async fn test_busy_user_lock_is_contention() {
        let store = InMemoryVoucherStore::new();
        store.put_voucher(open_voucher(5));
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let config = SeckillConfig {
            lock_retry: RetryPolicy::new(2, Duration::from_millis(1)),
            ..Default::default()
        };
        let service =
            VoucherOrderService::with_config(Arc::new(store.clone()), kv.clone(), config);

        // Another process serving the same user
        let other = DistributedLock::new(kv.clone(), "order:7");
        assert!(other.try_lock(Duration::from_secs(30)).await.unwrap());

        let outcome = service.seckill_voucher(&ctx(7), VOUCHER).await.unwrap();

        assert_eq!(outcome, ReservationOutcome::Rejected(Rejection::LockContention));
        assert_eq!(store.stock(VOUCHER), Some(5));
        assert_eq!(
            kv.get("lock:order:7").await.unwrap().as_deref(),
            Some(other.token())
        );
    }

    #[tokio::test]
    async fn test_trace_records_states() {
        let (_store, _kv, service) = setup(open_voucher(1));

        service.seckill_voucher(&ctx(1), VOUCHER).await.unwrap();
        service.seckill_voucher(&ctx(2), VOUCHER).await.unwrap();

        let history = service.recent_reservations();
        assert_eq!(history.len(), 2);
        assert_eq!(
            history[0].states(),
            vec![
                ReservationState::Validating,
                ReservationState::Serializing,
                ReservationState::ReservingStock,
                ReservationState::Minting,
                ReservationState::Committed,
            ]
        );
        // Stock hint is already zero for the second user
        assert_eq!(
            history[1].states(),
            vec![ReservationState::Validating, ReservationState::Rejected]
        );
        assert_eq!(
            history[1].outcome,
            Some(ReservationOutcome::Rejected(Rejection::InsufficientStock))
        );
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let store = InMemoryVoucherStore::new();
        let config = SeckillConfig {
            history_limit: 3,
            ..Default::default()
        };
        let service = VoucherOrderService::with_config(
            Arc::new(store),
            Arc::new(InMemoryKeyValueStore::new()),
            config,
        );

        for user in 0..5 {
            service.seckill_voucher(&ctx(user), VOUCHER).await.unwrap();
        }

        let history = service.recent_reservations();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].user_id, UserId(2));
        assert_eq!(history[2].user_id, UserId(4));
    }

    /// Voucher store whose transactions cannot be opened
    struct BrokenTransactions(InMemoryVoucherStore);

    #[async_trait]
    impl VoucherStore for BrokenTransactions {
        async fn find_voucher(&self, voucher_id: VoucherId) -> Result<Option<SeckillVoucher>> {
            self.0.find_voucher(voucher_id).await
        }

        async fn begin(&self) -> Result<Box<dyn OrderTransaction>> {
            Err(Error::store("connection reset"))
        }
    }

    #[tokio::test]
    async fn test_store_failure_propagates_and_releases_lock() {
        let store = InMemoryVoucherStore::new();
        store.put_voucher(open_voucher(5));
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let service = VoucherOrderService::new(
            Arc::new(BrokenTransactions(store.clone())),
            kv.clone(),
        );

        let result = service.seckill_voucher(&ctx(7), VOUCHER).await;

        assert_matches!(result, Err(Error::StoreUnavailable(_)));
        assert_eq!(kv.get("lock:order:7").await.unwrap(), None);
        assert_eq!(store.stock(VOUCHER), Some(5));
        assert_eq!(service.stats().failures, 1);
        let history = service.recent_reservations();
        assert!(history[0].error.is_some());
    }
}
