use std::collections::HashMap;
use std::sync::RwLock;

use eshop_core::{DomainError, DomainResult, OrderId};

use crate::order::Order;

/// Where placed orders are kept.
pub trait OrderBook: Send + Sync {
    fn insert(&self, order: Order) -> DomainResult<()>;

    fn get(&self, id: OrderId) -> Option<Order>;

    /// All orders, oldest first.
    fn list(&self) -> Vec<Order>;
}

#[derive(Debug, Default)]
pub struct InMemoryOrderBook {
    orders: RwLock<HashMap<OrderId, Order>>,
}

impl InMemoryOrderBook {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OrderBook for InMemoryOrderBook {
    fn insert(&self, order: Order) -> DomainResult<()> {
        let mut orders = self
            .orders
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if orders.contains_key(&order.id()) {
            return Err(DomainError::validation(format!(
                "order {} already exists",
                order.id()
            )));
        }
        orders.insert(order.id(), order);
        Ok(())
    }

    fn get(&self, id: OrderId) -> Option<Order> {
        self.orders
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .cloned()
    }

    fn list(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        orders.sort_by_key(Order::order_date);
        orders
    }
}
