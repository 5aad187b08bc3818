use async_trait::async_trait;

use crate::models::{LineItem, NewLineItem, Order, Product};
use crate::StoreResult;

/// Read-only product lookups outside of any order transaction.
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn find_product(&self, id: i64) -> StoreResult<Option<Product>>;

    async fn list_products(&self) -> StoreResult<Vec<Product>>;
}

/// Durable order storage. Every write goes through a transaction from `begin`.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn OrderTransaction>>;

    /// Committed order with its line items in creation order.
    async fn get_order(&self, id: i64) -> StoreResult<Option<Order>>;
}

/// One open transaction against an `OrderStore`.
///
/// Dropping a transaction that was neither committed nor rolled back must
/// discard all of its writes and release any row locks it holds.
#[async_trait]
pub trait OrderTransaction: Send {
    /// Inserts the order header; the returned order has no line items yet.
    async fn create_order(&mut self, customer_id: i64) -> StoreResult<Order>;

    /// Reads the product and holds a row lock on it until the transaction ends.
    async fn lock_product(&mut self, product_id: i64) -> StoreResult<Option<Product>>;

    /// Removes `quantity` units from stock if at least that many remain.
    /// Returns `false` and changes nothing otherwise.
    async fn decrement_stock(&mut self, product_id: i64, quantity: i32) -> StoreResult<bool>;

    async fn create_line_item(&mut self, item: NewLineItem) -> StoreResult<LineItem>;

    async fn commit(&mut self) -> StoreResult<()>;

    /// No-op when the transaction already finished.
    async fn rollback(&mut self) -> StoreResult<()>;
}
