use async_trait::async_trait;
use sqlx::PgPool;

use ecom_core::{Product, ProductCatalog, StoreResult};

use crate::order_repo::{map_db_error, ProductRow};

/// Read-only product queries straight off the pool, outside any order transaction.
pub struct StoreProductCatalog {
    pool: PgPool,
}

impl StoreProductCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProductCatalog for StoreProductCatalog {
    async fn find_product(&self, id: i64) -> StoreResult<Option<Product>> {
        let row = sqlx::query_as::<_, ProductRow>(
            "SELECT id, name, price_in_cents, quantity, created_at FROM products WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;

        Ok(row.map(Product::from))
    }

    async fn list_products(&self) -> StoreResult<Vec<Product>> {
        let rows = sqlx::query_as::<_, ProductRow>(
            "SELECT id, name, price_in_cents, quantity, created_at FROM products ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;

        Ok(rows.into_iter().map(Product::from).collect())
    }
}
