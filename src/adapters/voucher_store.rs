//! In-Memory Voucher Store
//!
//! Implements the `VoucherStore` / `OrderTransaction` ports with the same
//! semantics a relational store gives under READ COMMITTED:
//!
//! - the conditional decrement runs under the voucher row's lock, so two
//!   transactions can never both take the last unit;
//! - staged orders become visible only on commit;
//! - rollback (explicit or by drop) puts taken stock back.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::domain::ports::{
    OrderTransaction, SeckillVoucher, UserId, VoucherId, VoucherOrder, VoucherStore,
};
use crate::error::Result;

#[derive(Debug, Default)]
struct Tables {
    vouchers: DashMap<VoucherId, SeckillVoucher>,
    /// Committed orders keyed by order id
    orders: DashMap<i64, VoucherOrder>,
    /// Committed order count per (user, voucher)
    order_index: DashMap<(UserId, VoucherId), u64>,
}

/// In-memory voucher and order tables
#[derive(Debug, Clone, Default)]
pub struct InMemoryVoucherStore {
    tables: Arc<Tables>,
}

impl InMemoryVoucherStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a voucher
    pub fn put_voucher(&self, voucher: SeckillVoucher) {
        self.tables.vouchers.insert(voucher.voucher_id, voucher);
    }

    /// Current committed stock of a voucher
    pub fn stock(&self, voucher_id: VoucherId) -> Option<i64> {
        self.tables.vouchers.get(&voucher_id).map(|v| v.stock)
    }

    /// All committed orders
    pub fn orders(&self) -> Vec<VoucherOrder> {
        self.tables.orders.iter().map(|e| e.value().clone()).collect()
    }

    /// Committed orders for one voucher
    pub fn orders_for(&self, voucher_id: VoucherId) -> Vec<VoucherOrder> {
        self.tables
            .orders
            .iter()
            .filter(|e| e.voucher_id == voucher_id)
            .map(|e| e.value().clone())
            .collect()
    }
}

#[async_trait]
impl VoucherStore for InMemoryVoucherStore {
    async fn find_voucher(&self, voucher_id: VoucherId) -> Result<Option<SeckillVoucher>> {
        Ok(self.tables.vouchers.get(&voucher_id).map(|v| v.clone()))
    }

    async fn begin(&self) -> Result<Box<dyn OrderTransaction>> {
        Ok(Box::new(InMemoryTransaction {
            tables: Arc::clone(&self.tables),
            taken_stock: HashMap::new(),
            staged_orders: Vec::new(),
            finished: false,
        }))
    }
}

/// Transaction over the in-memory tables
struct InMemoryTransaction {
    tables: Arc<Tables>,
    /// Units decremented by this transaction, restored on rollback
    taken_stock: HashMap<VoucherId, i64>,
    staged_orders: Vec<VoucherOrder>,
    finished: bool,
}

impl InMemoryTransaction {
    fn undo(&mut self) {
        for (voucher_id, units) in self.taken_stock.drain() {
            if let Some(mut voucher) = self.tables.vouchers.get_mut(&voucher_id) {
                voucher.stock += units;
            }
        }
        self.staged_orders.clear();
        self.finished = true;
    }
}

#[async_trait]
impl OrderTransaction for InMemoryTransaction {
    async fn count_orders(&mut self, user_id: UserId, voucher_id: VoucherId) -> Result<u64> {
        let committed = self
            .tables
            .order_index
            .get(&(user_id, voucher_id))
            .map(|c| *c)
            .unwrap_or(0);
        let staged = self
            .staged_orders
            .iter()
            .filter(|o| o.user_id == user_id && o.voucher_id == voucher_id)
            .count() as u64;
        Ok(committed + staged)
    }

    async fn decrement_stock(&mut self, voucher_id: VoucherId) -> Result<bool> {
        // get_mut holds the shard write lock: check and decrement are one step
        let Some(mut voucher) = self.tables.vouchers.get_mut(&voucher_id) else {
            return Ok(false);
        };
        if voucher.stock <= 0 {
            return Ok(false);
        }
        voucher.stock -= 1;
        *self.taken_stock.entry(voucher_id).or_insert(0) += 1;
        Ok(true)
    }

    async fn insert_order(&mut self, order: &VoucherOrder) -> Result<()> {
        self.staged_orders.push(order.clone());
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        for order in self.staged_orders.drain(..) {
            *self
                .tables
                .order_index
                .entry((order.user_id, order.voucher_id))
                .or_insert(0) += 1;
            self.tables.orders.insert(order.id.as_i64(), order);
        }
        self.taken_stock.clear();
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.undo();
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Rolling back unfinished transaction");
            self.undo();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::GeneratedId;
    use chrono::{Duration, Utc};

    fn voucher(id: u64, stock: i64) -> SeckillVoucher {
        let now = Utc::now();
        SeckillVoucher::new(
            VoucherId(id),
            stock,
            now - Duration::hours(1),
            now + Duration::hours(1),
        )
    }

    fn order(id: i64, user: u64, voucher: u64) -> VoucherOrder {
        VoucherOrder {
            id: GeneratedId(id),
            user_id: UserId(user),
            voucher_id: VoucherId(voucher),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_commit_makes_order_visible() {
        let store = InMemoryVoucherStore::new();
        store.put_voucher(voucher(1, 2));

        let mut tx = store.begin().await.unwrap();
        assert!(tx.decrement_stock(VoucherId(1)).await.unwrap());
        tx.insert_order(&order(10, 7, 1)).await.unwrap();
        assert_eq!(tx.count_orders(UserId(7), VoucherId(1)).await.unwrap(), 1);
        assert!(store.orders().is_empty());
        tx.commit().await.unwrap();

        assert_eq!(store.stock(VoucherId(1)), Some(1));
        assert_eq!(store.orders_for(VoucherId(1)).len(), 1);

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.count_orders(UserId(7), VoucherId(1)).await.unwrap(), 1);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_decrement_never_goes_negative() {
        let store = InMemoryVoucherStore::new();
        store.put_voucher(voucher(1, 1));

        let mut tx = store.begin().await.unwrap();
        assert!(tx.decrement_stock(VoucherId(1)).await.unwrap());
        assert!(!tx.decrement_stock(VoucherId(1)).await.unwrap());
        tx.commit().await.unwrap();

        assert_eq!(store.stock(VoucherId(1)), Some(0));
    }

    #[tokio::test]
    async fn test_unknown_voucher_affects_no_rows() {
        let store = InMemoryVoucherStore::new();
        let mut tx = store.begin().await.unwrap();
        assert!(!tx.decrement_stock(VoucherId(99)).await.unwrap());
    }

    #[tokio::test]
    async fn test_rollback_restores_stock() {
        let store = InMemoryVoucherStore::new();
        store.put_voucher(voucher(1, 3));

        let mut tx = store.begin().await.unwrap();
        assert!(tx.decrement_stock(VoucherId(1)).await.unwrap());
        tx.insert_order(&order(10, 7, 1)).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.stock(VoucherId(1)), Some(3));
        assert!(store.orders().is_empty());
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let store = InMemoryVoucherStore::new();
        store.put_voucher(voucher(1, 3));

        {
            let mut tx = store.begin().await.unwrap();
            assert!(tx.decrement_stock(VoucherId(1)).await.unwrap());
            assert_eq!(store.stock(VoucherId(1)), Some(2));
        }

        assert_eq!(store.stock(VoucherId(1)), Some(3));
    }
}
