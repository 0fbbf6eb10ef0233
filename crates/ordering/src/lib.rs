//! `eshop-ordering`: turns basket checkouts into pending orders.

use std::sync::Arc;

use eshop_events::{EventBus, HandlerProvider};

pub mod handlers;
pub mod integration_events;
pub mod order;
pub mod order_book;

pub use handlers::BasketCheckoutIntegrationEventHandler;
pub use integration_events::{BasketCheckoutIntegrationEvent, BasketItem};
pub use order::{Order, OrderItem, OrderStatus};
pub use order_book::{InMemoryOrderBook, OrderBook};

/// Queue the ordering service consumes from.
pub const QUEUE: &str = "Ordering";

pub fn register_handlers(provider: &mut HandlerProvider, book: Arc<dyn OrderBook>) {
    provider.register_transient(move || BasketCheckoutIntegrationEventHandler::new(book.clone()));
}

/// Startup subscriptions of the ordering service.
pub async fn register_subscriptions<B: EventBus>(bus: &B) -> Result<(), B::Error> {
    bus.subscribe::<BasketCheckoutIntegrationEvent, BasketCheckoutIntegrationEventHandler>()
        .await
}
