use ecom_core::StoreError;

/// Every way `place_order` can fail. Each variant is a distinct, stable kind
/// so callers can map it to their own response category.
#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    /// Malformed request. Raised before any transaction is opened.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Product not found: {0}")]
    ProductNotFound(i64),

    #[error("Insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: i64,
        requested: i32,
        available: i32,
    },

    /// The deadline elapsed; the open transaction was dropped and rolled back.
    #[error("Order placement cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl OrderError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
