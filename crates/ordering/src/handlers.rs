use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use eshop_events::{IntegrationEvent, IntegrationEventHandler};

use crate::integration_events::BasketCheckoutIntegrationEvent;
use crate::order::Order;
use crate::order_book::OrderBook;

const APP_NAME: &str = "Ordering.API";

/// Places a pending order for every checked-out basket.
pub struct BasketCheckoutIntegrationEventHandler {
    book: Arc<dyn OrderBook>,
}

impl BasketCheckoutIntegrationEventHandler {
    pub fn new(book: Arc<dyn OrderBook>) -> Self {
        Self { book }
    }
}

#[async_trait]
impl IntegrationEventHandler<BasketCheckoutIntegrationEvent> for BasketCheckoutIntegrationEventHandler {
    async fn handle(&self, event: BasketCheckoutIntegrationEvent) -> anyhow::Result<()> {
        info!(
            event_id = %event.id(),
            app = APP_NAME,
            ?event,
            "Handling integration event"
        );

        let order = Order::from_checkout(&event)?;
        let order_id = order.id();
        self.book.insert(order)?;

        info!(order_id = %order_id, "Order {} created for {}", order_id, event.customer_name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration_events::BasketItem;
    use crate::order::OrderStatus;
    use crate::order_book::InMemoryOrderBook;
    use eshop_core::ProductId;

    fn checkout(items: Vec<BasketItem>) -> BasketCheckoutIntegrationEvent {
        BasketCheckoutIntegrationEvent::new(
            "bob".to_string(),
            "Bob".to_string(),
            "bob@example.com".to_string(),
            "2 High St".to_string(),
            1950,
            items,
        )
    }

    #[tokio::test]
    async fn places_a_pending_order() {
        let book = Arc::new(InMemoryOrderBook::new());
        let handler = BasketCheckoutIntegrationEventHandler::new(book.clone());

        handler
            .handle(checkout(vec![BasketItem {
                product_id: ProductId::new(),
                product_name: ".NET Blue Hoodie".to_string(),
                quantity: 1,
                price: 1950,
            }]))
            .await
            .unwrap();

        let orders = book.list();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status(), OrderStatus::Pending);
        assert_eq!(orders[0].customer_email(), "bob@example.com");
        assert_eq!(orders[0].total_amount(), 1950);
    }

    #[tokio::test]
    async fn invalid_checkout_fails_without_placing_an_order() {
        let book = Arc::new(InMemoryOrderBook::new());
        let handler = BasketCheckoutIntegrationEventHandler::new(book.clone());

        assert!(handler.handle(checkout(Vec::new())).await.is_err());
        assert!(book.list().is_empty());
    }
}
