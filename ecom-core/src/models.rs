use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Catalog entry. Owned by the catalog; the order flow only reads it and
/// decrements `quantity` under a row lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Product {
    pub id: i64,
    pub name: String,
    /// Unit price in cents
    pub price: i32,
    /// Units currently in stock
    pub quantity: i32,
    pub created_at: DateTime<Utc>,
}

impl Product {
    pub fn has_stock_for(&self, requested: i32) -> bool {
        self.quantity >= requested
    }
}

/// A customer's purchase record, written together with its line items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Order {
    pub id: i64,
    pub customer_id: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

impl Order {
    /// Sum of `price * quantity` over the line items, in cents.
    pub fn total(&self) -> i64 {
        self.line_items
            .iter()
            .map(|item| i64::from(item.price) * i64::from(item.quantity))
            .sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineItem {
    pub id: i64,
    pub order_id: i64,
    pub product_id: i64,
    pub quantity: i32,
    /// Unit price captured when the stock check authorized this item
    pub price: i32,
}

/// Insert payload for a line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewLineItem {
    pub order_id: i64,
    pub product_id: i64,
    pub quantity: i32,
    pub price: i32,
}
