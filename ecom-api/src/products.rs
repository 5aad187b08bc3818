use axum::{
    extract::{Path, State},
    Json,
};
use ecom_core::Product;

use crate::error::AppError;
use crate::state::AppState;

/// GET /products
pub async fn list_products(State(state): State<AppState>) -> Result<Json<Vec<Product>>, AppError> {
    let products = state.catalog.list_products().await?;
    Ok(Json(products))
}

/// GET /products/{id}
pub async fn get_product(
    State(state): State<AppState>,
    Path(product_id): Path<i64>,
) -> Result<Json<Product>, AppError> {
    let product = state
        .catalog
        .find_product(product_id)
        .await?
        .ok_or_else(|| AppError::NotFoundError(format!("Product not found: {}", product_id)))?;

    Ok(Json(product))
}
