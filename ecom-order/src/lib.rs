pub mod engine;
pub mod error;
pub mod request;

pub use engine::{OrderPlacementEngine, PlacementConfig};
pub use error::OrderError;
pub use request::{OrderItemRequest, PlaceOrderRequest};
