use std::sync::Arc;
use std::time::Duration;

use ecom_core::{NewLineItem, Order, OrderStore, OrderTransaction};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

use crate::error::OrderError;
use crate::request::PlaceOrderRequest;

#[derive(Debug, Clone)]
pub struct PlacementConfig {
    /// Upper bound for the whole transactional phase of one call
    pub deadline: Duration,
    /// Extra attempts after a lock/serialization conflict
    pub max_conflict_retries: u32,
    /// Base delay between conflict retries, multiplied by the attempt number
    pub conflict_backoff: Duration,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(30),
            max_conflict_retries: 3,
            conflict_backoff: Duration::from_millis(25),
        }
    }
}

/// Places orders: validates the request, then writes the order header and one
/// line item per requested product in a single transaction, taking the stock
/// for each item under a row lock.
pub struct OrderPlacementEngine {
    store: Arc<dyn OrderStore>,
    config: PlacementConfig,
}

impl OrderPlacementEngine {
    pub fn new(store: Arc<dyn OrderStore>, config: PlacementConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    /// Places the order within the configured deadline.
    pub async fn place_order(&self, request: &PlaceOrderRequest) -> Result<Order, OrderError> {
        self.place_order_until(request, deadline_from_now(self.config.deadline))
            .await
    }

    /// Places the order, giving up at `deadline`.
    ///
    /// Nothing is written unless every item can be fulfilled. On any failure
    /// after the transaction opened, it is rolled back before returning; when
    /// the deadline passes the in-flight transaction is dropped, which rolls
    /// it back as well.
    #[instrument(
        skip(self, request),
        fields(customer_id = request.customer_id, items = request.items.len())
    )]
    pub async fn place_order_until(
        &self,
        request: &PlaceOrderRequest,
        deadline: Instant,
    ) -> Result<Order, OrderError> {
        request.validate()?;

        match timeout_at(deadline, self.place_with_retry(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Order placement hit its deadline, transaction abandoned");
                Err(OrderError::Cancelled(
                    "deadline elapsed before the order was committed".to_string(),
                ))
            }
        }
    }

    async fn place_with_retry(&self, request: &PlaceOrderRequest) -> Result<Order, OrderError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.place_once(request).await {
                Err(OrderError::Storage(err))
                    if err.is_conflict() && attempt <= self.config.max_conflict_retries =>
                {
                    let delay = conflict_delay(self.config.conflict_backoff, attempt);
                    warn!(
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Order transaction conflicted, retrying"
                    );
                    sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn place_once(&self, request: &PlaceOrderRequest) -> Result<Order, OrderError> {
        let mut tx = self.store.begin().await?;

        let order = match write_order(tx.as_mut(), request).await {
            Ok(order) => order,
            Err(err) => {
                rollback_quietly(tx.as_mut(), &err).await;
                return Err(err);
            }
        };

        if let Err(err) = tx.commit().await {
            let err = OrderError::from(err);
            rollback_quietly(tx.as_mut(), &err).await;
            return Err(err);
        }

        info!(
            order_id = order.id,
            line_items = order.line_items.len(),
            total = order.total(),
            "Order placed"
        );
        Ok(order)
    }
}

async fn write_order(
    tx: &mut dyn OrderTransaction,
    request: &PlaceOrderRequest,
) -> Result<Order, OrderError> {
    let mut order = tx.create_order(request.customer_id).await?;

    for item in &request.items {
        let product = tx
            .lock_product(item.product_id)
            .await?
            .ok_or(OrderError::ProductNotFound(item.product_id))?;

        if !product.has_stock_for(item.quantity) {
            return Err(OrderError::InsufficientStock {
                product_id: product.id,
                requested: item.quantity,
                available: product.quantity,
            });
        }

        // The row is locked, so this only fails if the backend disagrees with
        // the read above.
        if !tx.decrement_stock(product.id, item.quantity).await? {
            return Err(OrderError::InsufficientStock {
                product_id: product.id,
                requested: item.quantity,
                available: product.quantity,
            });
        }

        let line_item = tx
            .create_line_item(NewLineItem {
                order_id: order.id,
                product_id: product.id,
                quantity: item.quantity,
                price: product.price,
            })
            .await?;
        debug!(
            order_id = order.id,
            product_id = product.id,
            quantity = item.quantity,
            "Line item written"
        );
        order.line_items.push(line_item);
    }

    Ok(order)
}

/// Deadlines too large for the clock fall back to roughly thirty years out.
fn deadline_from_now(deadline: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(deadline)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

/// Linear backoff, clamped rather than overflowing on large settings.
fn conflict_delay(backoff: Duration, attempt: u32) -> Duration {
    backoff.saturating_mul(attempt)
}

/// Rollback failures are logged; the causing error is what the caller sees.
async fn rollback_quietly(tx: &mut dyn OrderTransaction, cause: &OrderError) {
    if let Err(rollback_err) = tx.rollback().await {
        warn!(
            error = %rollback_err,
            cause = %cause,
            "Rollback failed after order placement error"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::OrderItemRequest;
    use ecom_core::StoreError;
    use ecom_store::memory::MemoryStore;

    fn engine(store: &MemoryStore) -> OrderPlacementEngine {
        OrderPlacementEngine::new(Arc::new(store.clone()), PlacementConfig::default())
    }

    fn request(customer_id: i64, items: &[(i64, i32)]) -> PlaceOrderRequest {
        PlaceOrderRequest::new(
            customer_id,
            items
                .iter()
                .map(|&(product_id, quantity)| OrderItemRequest::new(product_id, quantity))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_places_order_with_captured_prices() {
        let store = MemoryStore::new();
        let chair = store.add_product("Chair", 12_000, 10);
        let desk = store.add_product("Desk", 45_000, 2);

        let order = engine(&store)
            .place_order(&request(7, &[(chair.id, 4), (desk.id, 2)]))
            .await
            .unwrap();

        assert!(order.id > 0);
        assert_eq!(order.customer_id, 7);
        assert_eq!(order.line_items.len(), 2);
        assert_eq!(order.line_items[0].product_id, chair.id);
        assert_eq!(order.line_items[0].price, 12_000);
        assert_eq!(order.line_items[1].product_id, desk.id);
        assert_eq!(order.line_items[1].price, 45_000);

        let stored = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored, order);
        assert_eq!(store.line_item_count(), 2);
        assert_eq!(store.product(chair.id).unwrap().quantity, 6);
        assert_eq!(store.product(desk.id).unwrap().quantity, 0);
    }

    #[tokio::test]
    async fn test_validation_errors_touch_nothing() {
        let store = MemoryStore::new();
        let chair = store.add_product("Chair", 12_000, 10);
        store.fail_next_begin();
        let engine = engine(&store);

        for req in [
            request(0, &[(chair.id, 1)]),
            request(-3, &[(chair.id, 1)]),
            request(4, &[]),
            request(4, &[(chair.id, 0)]),
            request(4, &[(chair.id, 2), (chair.id, -1)]),
        ] {
            let err = engine.place_order(&req).await.unwrap_err();
            assert!(matches!(err, OrderError::Validation(_)), "{:?}", err);
        }

        // The armed begin failure is still pending, so no transaction was opened.
        assert!(store.begin().await.is_err());
        assert_eq!(store.order_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_product_rolls_back_everything() {
        let store = MemoryStore::new();
        let chair = store.add_product("Chair", 12_000, 10);

        let err = engine(&store)
            .place_order(&request(7, &[(chair.id, 3), (999, 1)]))
            .await
            .unwrap_err();

        assert!(matches!(err, OrderError::ProductNotFound(999)));
        assert_eq!(store.order_count(), 0);
        assert_eq!(store.line_item_count(), 0);
        assert_eq!(store.product(chair.id).unwrap().quantity, 10);
    }

    #[tokio::test]
    async fn test_insufficient_stock_rolls_back_everything() {
        let store = MemoryStore::new();
        let chair = store.add_product("Chair", 12_000, 10);
        let desk = store.add_product("Desk", 45_000, 2);

        let err = engine(&store)
            .place_order(&request(7, &[(chair.id, 5), (desk.id, 3)]))
            .await
            .unwrap_err();

        match err {
            OrderError::InsufficientStock { product_id, requested, available } => {
                assert_eq!(product_id, desk.id);
                assert_eq!(requested, 3);
                assert_eq!(available, 2);
            }
            other => panic!("expected insufficient stock, got {:?}", other),
        }
        assert_eq!(store.order_count(), 0);
        assert_eq!(store.product(chair.id).unwrap().quantity, 10);
        assert_eq!(store.product(desk.id).unwrap().quantity, 2);
    }

    #[tokio::test]
    async fn test_repeated_product_counts_against_same_stock() {
        let store = MemoryStore::new();
        let lamp = store.add_product("Lamp", 3_000, 5);

        let err = engine(&store)
            .place_order(&request(2, &[(lamp.id, 3), (lamp.id, 3)]))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::InsufficientStock { available: 2, .. }));

        let order = engine(&store)
            .place_order(&request(2, &[(lamp.id, 3), (lamp.id, 2)]))
            .await
            .unwrap();
        assert_eq!(order.line_items.len(), 2);
        assert_eq!(store.product(lamp.id).unwrap().quantity, 0);
    }

    #[tokio::test]
    async fn test_write_failure_on_second_item_leaves_store_untouched() {
        let store = MemoryStore::new();
        let chair = store.add_product("Chair", 12_000, 10);
        let desk = store.add_product("Desk", 45_000, 2);
        store.fail_line_item_write(2);

        let err = engine(&store)
            .place_order(&request(7, &[(chair.id, 1), (desk.id, 1)]))
            .await
            .unwrap_err();

        assert!(matches!(err, OrderError::Storage(StoreError::Unavailable(_))));
        assert_eq!(store.order_count(), 0);
        assert_eq!(store.line_item_count(), 0);
        assert_eq!(store.product(chair.id).unwrap().quantity, 10);
        assert_eq!(store.product(desk.id).unwrap().quantity, 2);
    }

    #[tokio::test]
    async fn test_begin_and_commit_failures_are_storage_errors() {
        let store = MemoryStore::new();
        let chair = store.add_product("Chair", 12_000, 10);
        let engine = engine(&store);

        store.fail_next_begin();
        let err = engine.place_order(&request(1, &[(chair.id, 1)])).await.unwrap_err();
        assert!(matches!(err, OrderError::Storage(_)));

        store.fail_next_commit();
        let err = engine.place_order(&request(1, &[(chair.id, 1)])).await.unwrap_err();
        assert!(matches!(err, OrderError::Storage(_)));

        assert_eq!(store.order_count(), 0);
        assert_eq!(store.product(chair.id).unwrap().quantity, 10);
    }

    #[tokio::test]
    async fn test_rollback_failure_does_not_mask_cause() {
        let store = MemoryStore::new();
        store.fail_next_rollback();

        let err = engine(&store)
            .place_order(&request(1, &[(31, 1)]))
            .await
            .unwrap_err();

        assert!(matches!(err, OrderError::ProductNotFound(31)));
        assert_eq!(store.order_count(), 0);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried_then_surfaced() {
        let store = MemoryStore::new();
        let chair = store.add_product("Chair", 12_000, 10);
        let config = PlacementConfig {
            max_conflict_retries: 2,
            conflict_backoff: Duration::from_millis(1),
            ..PlacementConfig::default()
        };
        let engine = OrderPlacementEngine::new(Arc::new(store.clone()), config);

        store.conflict_on_lock(2);
        let order = engine.place_order(&request(1, &[(chair.id, 1)])).await.unwrap();
        assert_eq!(order.line_items.len(), 1);
        assert_eq!(store.order_count(), 1);

        store.conflict_on_lock(3);
        let err = engine.place_order(&request(1, &[(chair.id, 1)])).await.unwrap_err();
        assert!(matches!(err, OrderError::Storage(StoreError::Conflict(_))));
        assert_eq!(store.order_count(), 1);
        assert_eq!(store.product(chair.id).unwrap().quantity, 9);
    }

    #[test]
    fn test_conflict_delay_grows_and_saturates() {
        let backoff = Duration::from_millis(25);
        assert_eq!(conflict_delay(backoff, 1), Duration::from_millis(25));
        assert_eq!(conflict_delay(backoff, 3), Duration::from_millis(75));
        assert_eq!(conflict_delay(Duration::MAX, 2), Duration::MAX);
        assert_eq!(conflict_delay(Duration::from_millis(u64::MAX), u32::MAX), Duration::MAX);
    }

    #[tokio::test]
    async fn test_huge_settings_do_not_overflow() {
        let store = MemoryStore::new();
        let chair = store.add_product("Chair", 12_000, 10);
        let config = PlacementConfig {
            deadline: Duration::from_millis(u64::MAX),
            max_conflict_retries: 1,
            conflict_backoff: Duration::from_millis(1),
        };
        let engine = OrderPlacementEngine::new(Arc::new(store.clone()), config);

        store.conflict_on_lock(1);
        let order = engine.place_order(&request(2, &[(chair.id, 1)])).await.unwrap();
        assert_eq!(order.line_items.len(), 1);
        assert!(deadline_from_now(Duration::MAX) > Instant::now());
    }

    #[tokio::test]
    async fn test_deadline_cancels_and_rolls_back() {
        let store = MemoryStore::new();
        let desk = store.add_product("Desk", 45_000, 2);
        let chair = store.add_product("Chair", 12_000, 10);

        // Another writer holds the desk row.
        let mut holder = store.begin().await.unwrap();
        holder.lock_product(desk.id).await.unwrap();

        let config = PlacementConfig {
            deadline: Duration::from_millis(50),
            ..PlacementConfig::default()
        };
        let engine = OrderPlacementEngine::new(Arc::new(store.clone()), config);

        let err = engine
            .place_order(&request(3, &[(chair.id, 1), (desk.id, 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::Cancelled(_)));
        assert_eq!(store.order_count(), 0);

        holder.rollback().await.unwrap();

        // The chair lock taken by the abandoned attempt was released.
        let order = engine
            .place_order(&request(3, &[(chair.id, 1), (desk.id, 1)]))
            .await
            .unwrap();
        assert_eq!(order.line_items.len(), 2);
        assert_eq!(store.product(chair.id).unwrap().quantity, 9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_orders_never_oversell() {
        const STOCK: i32 = 5;
        const BUYERS: i64 = 8;

        let store = MemoryStore::new();
        let console = store.add_product("Console", 49_900, STOCK);
        let engine = Arc::new(engine(&store));

        let mut tasks = tokio::task::JoinSet::new();
        for customer_id in 1..=BUYERS {
            let engine = engine.clone();
            let req = request(customer_id, &[(console.id, STOCK)]);
            tasks.spawn(async move { engine.place_order(&req).await });
        }

        let mut placed = 0;
        let mut rejected = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined.unwrap() {
                Ok(_) => placed += 1,
                Err(OrderError::InsufficientStock { available: 0, .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {:?}", other),
            }
        }

        assert_eq!(placed, 1);
        assert_eq!(rejected, BUYERS - 1);
        let sold: i32 = store
            .orders()
            .iter()
            .flat_map(|order| order.line_items.iter())
            .filter(|item| item.product_id == console.id)
            .map(|item| item.quantity)
            .sum();
        assert_eq!(sold, STOCK);
        assert_eq!(store.product(console.id).unwrap().quantity, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_small_orders_sum_to_stock() {
        let store = MemoryStore::new();
        let bulb = store.add_product("Bulb", 399, 10);
        let engine = Arc::new(engine(&store));

        let mut tasks = tokio::task::JoinSet::new();
        for customer_id in 1..=25 {
            let engine = engine.clone();
            let req = request(customer_id, &[(bulb.id, 1)]);
            tasks.spawn(async move { engine.place_order(&req).await });
        }

        let mut placed = 0;
        while let Some(joined) = tasks.join_next().await {
            if joined.unwrap().is_ok() {
                placed += 1;
            }
        }

        assert_eq!(placed, 10);
        assert_eq!(store.line_item_count(), 10);
        assert_eq!(store.product(bulb.id).unwrap().quantity, 0);
    }
}
