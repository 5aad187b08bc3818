use std::sync::Arc;

use ecom_core::{OrderStore, ProductCatalog};
use ecom_order::{OrderPlacementEngine, PlacementConfig};
use ecom_store::app_config::OrdersConfig;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<OrderPlacementEngine>,
    pub orders: Arc<dyn OrderStore>,
    pub catalog: Arc<dyn ProductCatalog>,
}

impl AppState {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        catalog: Arc<dyn ProductCatalog>,
        placement: PlacementConfig,
    ) -> Self {
        Self {
            engine: Arc::new(OrderPlacementEngine::new(orders.clone(), placement)),
            orders,
            catalog,
        }
    }
}

pub fn placement_config(orders: &OrdersConfig) -> PlacementConfig {
    PlacementConfig {
        deadline: orders.deadline(),
        max_conflict_retries: orders.max_conflict_retries,
        conflict_backoff: orders.conflict_backoff(),
    }
}
