use serde::{Deserialize, Serialize};

use eshop_core::ProductId;

/// One basket line at checkout time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasketItem {
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: u32,
    /// Unit price in cents.
    pub price: u64,
}

eshop_events::integration_event! {
    /// A customer checked out their basket.
    pub struct BasketCheckoutIntegrationEvent {
        user_name: String,
        customer_name: String,
        customer_email: String,
        shipping_address: String,
        /// Cents.
        total_price: u64,
        items: Vec<BasketItem>,
    }
}
