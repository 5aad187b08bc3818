use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{instrument, warn};

use ecom_core::{
    LineItem, NewLineItem, Order, OrderStore, OrderTransaction, Product, StoreError, StoreResult,
};

/// SQLSTATEs that mean "another transaction got in the way": serialization
/// failure, deadlock, lock not available.
const CONFLICT_CODES: [&str; 3] = ["40001", "40P01", "55P03"];

pub(crate) fn map_db_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            if db.code().is_some_and(|code| CONFLICT_CODES.contains(&&*code)) {
                return StoreError::Conflict(db.message().to_string());
            }
            StoreError::database(err)
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Unavailable(err.to_string())
        }
        _ => StoreError::database(err),
    }
}

pub struct StoreOrderRepository {
    pool: PgPool,
}

impl StoreOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: i64,
    customer_id: i64,
    created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(sqlx::FromRow)]
struct LineItemRow {
    id: i64,
    order_id: i64,
    product_id: i64,
    quantity: i32,
    price_in_cents: i32,
}

#[derive(sqlx::FromRow)]
pub(crate) struct ProductRow {
    id: i64,
    name: String,
    price_in_cents: i32,
    quantity: i32,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<OrderRow> for Order {
    fn from(row: OrderRow) -> Self {
        Order {
            id: row.id,
            customer_id: row.customer_id,
            created_at: row.created_at,
            line_items: Vec::new(),
        }
    }
}

impl From<LineItemRow> for LineItem {
    fn from(row: LineItemRow) -> Self {
        LineItem {
            id: row.id,
            order_id: row.order_id,
            product_id: row.product_id,
            quantity: row.quantity,
            price: row.price_in_cents,
        }
    }
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Product {
            id: row.id,
            name: row.name,
            price: row.price_in_cents,
            quantity: row.quantity,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl OrderStore for StoreOrderRepository {
    async fn begin(&self) -> StoreResult<Box<dyn OrderTransaction>> {
        let tx = self.pool.begin().await.map_err(map_db_error)?;
        Ok(Box::new(PgOrderTransaction { tx: Some(tx) }))
    }

    async fn get_order(&self, id: i64) -> StoreResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(
            "SELECT id, customer_id, created_at FROM orders WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let items = sqlx::query_as::<_, LineItemRow>(
            "SELECT id, order_id, product_id, quantity, price_in_cents FROM order_items WHERE order_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;

        let mut order = Order::from(row);
        order.line_items = items.into_iter().map(LineItem::from).collect();
        Ok(Some(order))
    }
}

/// Wraps a pooled Postgres transaction. sqlx rolls back a transaction that is
/// dropped while still open, so abandoning one is safe.
pub struct PgOrderTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgOrderTransaction {
    fn executor(&mut self) -> StoreResult<&mut sqlx::PgConnection> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| StoreError::Unavailable("transaction already finished".into()))?;
        Ok(&mut **tx)
    }
}

#[async_trait]
impl OrderTransaction for PgOrderTransaction {
    #[instrument(skip(self))]
    async fn create_order(&mut self, customer_id: i64) -> StoreResult<Order> {
        let row = sqlx::query_as::<_, OrderRow>(
            "INSERT INTO orders (customer_id) VALUES ($1) RETURNING id, customer_id, created_at",
        )
        .bind(customer_id)
        .fetch_one(self.executor()?)
        .await
        .map_err(map_db_error)?;

        Ok(row.into())
    }

    #[instrument(skip(self))]
    async fn lock_product(&mut self, product_id: i64) -> StoreResult<Option<Product>> {
        let row = sqlx::query_as::<_, ProductRow>(
            "SELECT id, name, price_in_cents, quantity, created_at FROM products WHERE id = $1 FOR UPDATE",
        )
        .bind(product_id)
        .fetch_optional(self.executor()?)
        .await
        .map_err(map_db_error)?;

        Ok(row.map(Product::from))
    }

    #[instrument(skip(self))]
    async fn decrement_stock(&mut self, product_id: i64, quantity: i32) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE products SET quantity = quantity - $2 WHERE id = $1 AND quantity >= $2",
        )
        .bind(product_id)
        .bind(quantity)
        .execute(self.executor()?)
        .await
        .map_err(map_db_error)?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn create_line_item(&mut self, item: NewLineItem) -> StoreResult<LineItem> {
        let row = sqlx::query_as::<_, LineItemRow>(
            r#"
            INSERT INTO order_items (order_id, product_id, quantity, price_in_cents)
            VALUES ($1, $2, $3, $4)
            RETURNING id, order_id, product_id, quantity, price_in_cents
            "#,
        )
        .bind(item.order_id)
        .bind(item.product_id)
        .bind(item.quantity)
        .bind(item.price)
        .fetch_one(self.executor()?)
        .await
        .map_err(map_db_error)?;

        Ok(row.into())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        match self.tx.take() {
            Some(tx) => tx.commit().await.map_err(map_db_error),
            None => Err(StoreError::Unavailable("transaction already finished".into())),
        }
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        match self.tx.take() {
            Some(tx) => tx.rollback().await.map_err(map_db_error),
            None => Ok(()),
        }
    }
}

impl Drop for PgOrderTransaction {
    fn drop(&mut self) {
        if self.tx.is_some() {
            warn!("Order transaction dropped without commit - rolling back");
        }
    }
}
