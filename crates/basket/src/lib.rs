//! `eshop-basket`: integration events consumed by the basket service.
//!
//! The basket listens for catalog price changes so that open baskets can be
//! re-priced. Events are declared here as wire contracts; nothing is shared
//! with the catalog crate except the JSON shape.

use std::sync::Arc;

use eshop_events::{EventBus, HandlerProvider};

pub mod handlers;
pub mod integration_events;
pub mod price_watch;

pub use handlers::ProductPriceChangedIntegrationEventHandler;
pub use integration_events::ProductPriceChangedIntegrationEvent;
pub use price_watch::{PriceNotice, PriceWatch};

/// Queue the basket service consumes from.
pub const QUEUE: &str = "Basket";

/// Make the basket's handlers resolvable by the bus.
pub fn register_handlers(provider: &mut HandlerProvider, watch: Arc<PriceWatch>) {
    provider.register_transient(move || ProductPriceChangedIntegrationEventHandler::new(watch.clone()));
}

/// Startup subscriptions of the basket service.
pub async fn register_subscriptions<B: EventBus>(bus: &B) -> Result<(), B::Error> {
    bus.subscribe::<ProductPriceChangedIntegrationEvent, ProductPriceChangedIntegrationEventHandler>()
        .await
}
