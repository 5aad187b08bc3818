use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use ecom_core::{LineItem, Order};
use ecom_order::PlaceOrderRequest;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: i64,
    pub customer_id: i64,
    pub items: Vec<OrderItemResponse>,
    pub total_in_cents: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderItemResponse {
    pub id: i64,
    pub product_id: i64,
    pub quantity: i32,
    pub price_in_cents: i32,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        let total_in_cents = order.total();
        Self {
            id: order.id,
            customer_id: order.customer_id,
            items: order.line_items.into_iter().map(OrderItemResponse::from).collect(),
            total_in_cents,
            created_at: order.created_at,
        }
    }
}

impl From<LineItem> for OrderItemResponse {
    fn from(item: LineItem) -> Self {
        Self {
            id: item.id,
            product_id: item.product_id,
            quantity: item.quantity,
            price_in_cents: item.price,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /orders
pub async fn place_order(
    State(state): State<AppState>,
    payload: Result<Json<PlaceOrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<OrderResponse>), AppError> {
    let Json(req) = payload?;
    let order = state.engine.place_order(&req).await?;
    Ok((StatusCode::CREATED, Json(order.into())))
}

/// GET /orders/{id}
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<i64>,
) -> Result<Json<OrderResponse>, AppError> {
    let order = state
        .orders
        .get_order(order_id)
        .await?
        .ok_or_else(|| AppError::NotFoundError(format!("Order not found: {}", order_id)))?;

    Ok(Json(order.into()))
}
