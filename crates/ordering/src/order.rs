use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use eshop_core::{DomainError, DomainResult, OrderId, OrderItemId, ProductId};

use crate::integration_events::BasketCheckoutIntegrationEvent;

/// Order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: OrderItemId,
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: u32,
    /// Price in smallest currency unit (e.g., cents).
    pub unit_price: u64,
}

impl OrderItem {
    pub fn line_total(&self) -> u64 {
        self.unit_price.saturating_mul(u64::from(self.quantity))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    customer_name: String,
    customer_email: String,
    shipping_address: String,
    order_date: DateTime<Utc>,
    status: OrderStatus,
    total_amount: u64,
    items: Vec<OrderItem>,
}

impl Order {
    /// Build a pending order from a checked-out basket.
    ///
    /// The basket's total is taken as-is; line totals are not re-summed.
    pub fn from_checkout(checkout: &BasketCheckoutIntegrationEvent) -> DomainResult<Self> {
        if checkout.items().is_empty() {
            return Err(DomainError::validation("checkout has no items"));
        }
        if let Some(item) = checkout.items().iter().find(|item| item.quantity == 0) {
            return Err(DomainError::validation(format!(
                "item {} has zero quantity",
                item.product_id
            )));
        }

        Ok(Self {
            id: OrderId::new(),
            customer_name: checkout.customer_name().clone(),
            customer_email: checkout.customer_email().clone(),
            shipping_address: checkout.shipping_address().clone(),
            order_date: Utc::now(),
            status: OrderStatus::Pending,
            total_amount: *checkout.total_price(),
            items: checkout
                .items()
                .iter()
                .map(|item| OrderItem {
                    id: OrderItemId::new(),
                    product_id: item.product_id,
                    product_name: item.product_name.clone(),
                    quantity: item.quantity,
                    unit_price: item.price,
                })
                .collect(),
        })
    }

    pub fn id(&self) -> OrderId {
        self.id
    }

    pub fn customer_name(&self) -> &str {
        &self.customer_name
    }

    pub fn customer_email(&self) -> &str {
        &self.customer_email
    }

    pub fn shipping_address(&self) -> &str {
        &self.shipping_address
    }

    pub fn order_date(&self) -> DateTime<Utc> {
        self.order_date
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn total_amount(&self) -> u64 {
        self.total_amount
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }
}
