//! In-process store with the same transactional contract as Postgres.
//!
//! Writes are staged per transaction and applied on commit. `lock_product`
//! takes a per-row async mutex that is held until commit, rollback or drop,
//! which gives the same serialization as `SELECT ... FOR UPDATE`. A lock wait
//! that would close a cycle of waiting transactions fails with
//! `StoreError::Conflict` instead of blocking, as Postgres reports a deadlock.
//! Faults can be armed to exercise the failure paths of callers.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use ecom_core::{
    LineItem, NewLineItem, Order, OrderStore, OrderTransaction, Product, ProductCatalog,
    StoreError, StoreResult,
};

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    faults: Mutex<Faults>,
    next_product_id: AtomicI64,
    next_order_id: AtomicI64,
    next_line_item_id: AtomicI64,
    next_tx_id: AtomicU64,
}

#[derive(Default)]
struct State {
    products: BTreeMap<i64, Product>,
    row_locks: HashMap<i64, Arc<tokio::sync::Mutex<()>>>,
    /// product id -> transaction holding its row lock
    lock_holders: HashMap<i64, u64>,
    /// transaction id -> product whose row lock it is waiting for
    lock_waits: HashMap<u64, i64>,
    orders: BTreeMap<i64, Order>,
}

impl State {
    /// Whether `tx` waiting for `product_id` would wait on itself through a
    /// chain of holders and their own waits.
    fn closes_wait_cycle(&self, tx: u64, product_id: i64) -> bool {
        let mut wanted = product_id;
        for _ in 0..=self.lock_waits.len() {
            let Some(&holder) = self.lock_holders.get(&wanted) else {
                return false;
            };
            if holder == tx {
                return true;
            }
            match self.lock_waits.get(&holder) {
                Some(&next) => wanted = next,
                None => return false,
            }
        }
        false
    }

    fn release_tx(&mut self, tx: u64) {
        self.lock_waits.remove(&tx);
        self.lock_holders.retain(|_, holder| *holder != tx);
    }
}

/// One-shot failures; each is cleared when it fires.
#[derive(Default)]
struct Faults {
    fail_begin: bool,
    fail_line_item_write: Option<usize>,
    fail_commit: bool,
    fail_rollback: bool,
    lock_conflicts: u32,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_product(&self, name: &str, price: i32, quantity: i32) -> Product {
        let product = Product {
            id: self.inner.next_product_id.fetch_add(1, Ordering::SeqCst) + 1,
            name: name.to_string(),
            price,
            quantity,
            created_at: Utc::now(),
        };
        let mut state = self.inner.state();
        state.row_locks.insert(product.id, Arc::new(tokio::sync::Mutex::new(())));
        state.products.insert(product.id, product.clone());
        product
    }

    /// Committed view of a product.
    pub fn product(&self, id: i64) -> Option<Product> {
        self.inner.state().products.get(&id).cloned()
    }

    pub fn orders(&self) -> Vec<Order> {
        self.inner.state().orders.values().cloned().collect()
    }

    pub fn order_count(&self) -> usize {
        self.inner.state().orders.len()
    }

    pub fn line_item_count(&self) -> usize {
        self.inner
            .state()
            .orders
            .values()
            .map(|order| order.line_items.len())
            .sum()
    }

    pub fn fail_next_begin(&self) {
        self.inner.faults().fail_begin = true;
    }

    /// Fails the `nth` (1-based) line item write of the next transaction to reach it.
    pub fn fail_line_item_write(&self, nth: usize) {
        self.inner.faults().fail_line_item_write = Some(nth);
    }

    pub fn fail_next_commit(&self) {
        self.inner.faults().fail_commit = true;
    }

    pub fn fail_next_rollback(&self) {
        self.inner.faults().fail_rollback = true;
    }

    /// The next `times` row lock attempts report a conflict.
    pub fn conflict_on_lock(&self, times: u32) {
        self.inner.faults().lock_conflicts = times;
    }
}

#[async_trait]
impl ProductCatalog for MemoryStore {
    async fn find_product(&self, id: i64) -> StoreResult<Option<Product>> {
        Ok(self.product(id))
    }

    async fn list_products(&self) -> StoreResult<Vec<Product>> {
        Ok(self.inner.state().products.values().cloned().collect())
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn OrderTransaction>> {
        if std::mem::take(&mut self.inner.faults().fail_begin) {
            return Err(StoreError::Unavailable("injected begin failure".into()));
        }
        Ok(Box::new(MemoryTransaction {
            id: self.inner.next_tx_id.fetch_add(1, Ordering::SeqCst) + 1,
            inner: self.inner.clone(),
            orders: Vec::new(),
            stock_taken: HashMap::new(),
            locks: HashMap::new(),
            line_item_writes: 0,
            finished: false,
        }))
    }

    async fn get_order(&self, id: i64) -> StoreResult<Option<Order>> {
        Ok(self.inner.state().orders.get(&id).cloned())
    }
}

pub struct MemoryTransaction {
    id: u64,
    inner: Arc<Inner>,
    orders: Vec<Order>,
    stock_taken: HashMap<i64, i32>,
    locks: HashMap<i64, OwnedMutexGuard<()>>,
    line_item_writes: usize,
    finished: bool,
}

impl MemoryTransaction {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.finished {
            return Err(StoreError::Unavailable("transaction already finished".into()));
        }
        Ok(())
    }

    /// Takes the row lock unless this transaction already holds it.
    /// Returns `false` when the product does not exist.
    async fn acquire_row(&mut self, product_id: i64) -> StoreResult<bool> {
        if self.locks.contains_key(&product_id) {
            return Ok(true);
        }
        {
            let mut faults = self.inner.faults();
            if faults.lock_conflicts > 0 {
                faults.lock_conflicts -= 1;
                return Err(StoreError::Conflict(format!(
                    "could not lock product {}",
                    product_id
                )));
            }
        }
        let row = {
            let mut state = self.inner.state();
            let Some(row) = state.row_locks.get(&product_id).cloned() else {
                return Ok(false);
            };
            match row.clone().try_lock_owned() {
                Ok(guard) => {
                    state.lock_holders.insert(product_id, self.id);
                    self.locks.insert(product_id, guard);
                    return Ok(true);
                }
                Err(_) if state.closes_wait_cycle(self.id, product_id) => {
                    debug!(tx = self.id, product_id, "Row lock wait would deadlock");
                    return Err(StoreError::Conflict(format!(
                        "deadlock detected waiting for product {}",
                        product_id
                    )));
                }
                Err(_) => {
                    state.lock_waits.insert(self.id, product_id);
                    row
                }
            }
        };

        let waiting = LockWait { inner: &self.inner, tx: self.id };
        let guard = row.lock_owned().await;
        drop(waiting);
        let mut state = self.inner.state();
        state.lock_holders.insert(product_id, self.id);
        self.locks.insert(product_id, guard);
        Ok(true)
    }

    /// Committed stock minus what this transaction already took.
    fn visible_product(&self, product_id: i64) -> Option<Product> {
        let mut product = self.inner.state().products.get(&product_id).cloned()?;
        product.quantity -= self.stock_taken.get(&product_id).copied().unwrap_or(0);
        Some(product)
    }

    fn discard(&mut self) {
        self.orders.clear();
        self.stock_taken.clear();
        self.inner.state().release_tx(self.id);
        self.locks.clear();
        self.finished = true;
    }
}

#[async_trait]
impl OrderTransaction for MemoryTransaction {
    async fn create_order(&mut self, customer_id: i64) -> StoreResult<Order> {
        self.ensure_open()?;
        let order = Order {
            id: self.inner.next_order_id.fetch_add(1, Ordering::SeqCst) + 1,
            customer_id,
            created_at: Utc::now(),
            line_items: Vec::new(),
        };
        self.orders.push(order.clone());
        Ok(order)
    }

    async fn lock_product(&mut self, product_id: i64) -> StoreResult<Option<Product>> {
        self.ensure_open()?;
        if !self.acquire_row(product_id).await? {
            return Ok(None);
        }
        Ok(self.visible_product(product_id))
    }

    async fn decrement_stock(&mut self, product_id: i64, quantity: i32) -> StoreResult<bool> {
        self.ensure_open()?;
        if !self.acquire_row(product_id).await? {
            return Ok(false);
        }
        match self.visible_product(product_id) {
            Some(product) if product.quantity >= quantity => {
                *self.stock_taken.entry(product_id).or_insert(0) += quantity;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_line_item(&mut self, item: NewLineItem) -> StoreResult<LineItem> {
        self.ensure_open()?;
        self.line_item_writes += 1;
        {
            let mut faults = self.inner.faults();
            if faults.fail_line_item_write == Some(self.line_item_writes) {
                faults.fail_line_item_write = None;
                return Err(StoreError::Unavailable(format!(
                    "injected failure on line item write {}",
                    self.line_item_writes
                )));
            }
        }
        let order = self
            .orders
            .iter_mut()
            .find(|order| order.id == item.order_id)
            .ok_or_else(|| {
                StoreError::Database(
                    format!("order {} does not exist in this transaction", item.order_id).into(),
                )
            })?;
        let line_item = LineItem {
            id: self.inner.next_line_item_id.fetch_add(1, Ordering::SeqCst) + 1,
            order_id: item.order_id,
            product_id: item.product_id,
            quantity: item.quantity,
            price: item.price,
        };
        order.line_items.push(line_item.clone());
        Ok(line_item)
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        if std::mem::take(&mut self.inner.faults().fail_commit) {
            return Err(StoreError::Unavailable("injected commit failure".into()));
        }
        {
            let mut state = self.inner.state();
            for (product_id, taken) in &self.stock_taken {
                if let Some(product) = state.products.get_mut(product_id) {
                    product.quantity -= taken;
                }
            }
            for order in self.orders.drain(..) {
                state.orders.insert(order.id, order);
            }
        }
        debug!(rows_locked = self.locks.len(), "Memory transaction committed");
        self.discard();
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        if self.finished {
            return Ok(());
        }
        self.discard();
        if std::mem::take(&mut self.inner.faults().fail_rollback) {
            return Err(StoreError::Unavailable("injected rollback failure".into()));
        }
        Ok(())
    }
}

/// Clears the wait entry once the wait ends, including when the waiting
/// future is dropped.
struct LockWait<'a> {
    inner: &'a Inner,
    tx: u64,
}

impl Drop for LockWait<'_> {
    fn drop(&mut self) {
        self.inner.state().lock_waits.remove(&self.tx);
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Memory transaction dropped without commit - discarding staged writes");
            self.inner.state().release_tx(self.id);
        }
    }
}
