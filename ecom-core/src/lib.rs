pub mod models;
pub mod repository;

pub use models::{LineItem, NewLineItem, Order, Product};
pub use repository::{OrderStore, OrderTransaction, ProductCatalog};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures surfaced by any storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[source] BoxError),
    /// Lock or serialization conflict; the whole unit of work may be retried.
    #[error("Storage conflict: {0}")]
    Conflict(String),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn database<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Database(Box::new(err))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
