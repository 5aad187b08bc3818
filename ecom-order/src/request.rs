use serde::{Deserialize, Deserializer, Serialize};

use crate::error::OrderError;

/// Inbound "place order" payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaceOrderRequest {
    #[serde(default)]
    pub customer_id: i64,
    /// Absent or `null` decodes as empty so that `validate` reports it.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub items: Vec<OrderItemRequest>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<OrderItemRequest>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<OrderItemRequest>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderItemRequest {
    pub product_id: i64,
    pub quantity: i32,
}

impl PlaceOrderRequest {
    pub fn new(customer_id: i64, items: Vec<OrderItemRequest>) -> Self {
        Self { customer_id, items }
    }

    /// Structural checks only; nothing here touches storage.
    pub fn validate(&self) -> Result<(), OrderError> {
        if self.customer_id <= 0 {
            return Err(OrderError::validation("customer ID is required"));
        }
        if self.items.is_empty() {
            return Err(OrderError::validation("at least one item is required"));
        }
        if let Some((index, item)) = self
            .items
            .iter()
            .enumerate()
            .find(|(_, item)| item.quantity <= 0)
        {
            return Err(OrderError::Validation(format!(
                "item {} (product {}) must have a positive quantity, got {}",
                index, item.product_id, item.quantity
            )));
        }
        Ok(())
    }
}

impl OrderItemRequest {
    pub fn new(product_id: i64, quantity: i32) -> Self {
        Self { product_id, quantity }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_request_passes() {
        let req = PlaceOrderRequest::new(1, vec![OrderItemRequest::new(10, 2)]);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_non_positive_customer_rejected() {
        for customer_id in [0, -1, i64::MIN] {
            let req = PlaceOrderRequest::new(customer_id, vec![OrderItemRequest::new(10, 1)]);
            assert!(matches!(req.validate(), Err(OrderError::Validation(_))));
        }
    }

    #[test]
    fn test_empty_items_rejected() {
        let req = PlaceOrderRequest::new(5, vec![]);
        let err = req.validate().unwrap_err();
        assert_eq!(err.to_string(), "Validation failed: at least one item is required");
    }

    #[test]
    fn test_zero_or_negative_quantity_rejected() {
        let req = PlaceOrderRequest::new(
            5,
            vec![OrderItemRequest::new(10, 3), OrderItemRequest::new(11, 0)],
        );
        match req.validate() {
            Err(OrderError::Validation(msg)) => assert!(msg.contains("product 11")),
            other => panic!("expected validation error, got {:?}", other),
        }

        let req = PlaceOrderRequest::new(5, vec![OrderItemRequest::new(10, -4)]);
        assert!(matches!(req.validate(), Err(OrderError::Validation(_))));
    }

    #[test]
    fn test_request_json_shape() {
        let req: PlaceOrderRequest = serde_json::from_value(serde_json::json!({
            "customer_id": 3,
            "items": [{ "product_id": 8, "quantity": 2 }]
        }))
        .unwrap();

        assert_eq!(req, PlaceOrderRequest::new(3, vec![OrderItemRequest::new(8, 2)]));
    }

    #[test]
    fn test_missing_or_null_items_reach_validation() {
        for body in [
            serde_json::json!({ "customer_id": 5 }),
            serde_json::json!({ "customer_id": 5, "items": null }),
        ] {
            let req: PlaceOrderRequest = serde_json::from_value(body).unwrap();
            assert!(req.items.is_empty());
            let err = req.validate().unwrap_err();
            assert_eq!(err.to_string(), "Validation failed: at least one item is required");
        }

        let req: PlaceOrderRequest = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(matches!(
            req.validate(),
            Err(OrderError::Validation(msg)) if msg.contains("customer ID")
        ));
    }
}
