use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use eshop_events::{IntegrationEvent, IntegrationEventHandler};

use crate::integration_events::ProductPriceChangedIntegrationEvent;
use crate::price_watch::{PriceNotice, PriceWatch};

const APP_NAME: &str = "Basket.API";

/// Records catalog price changes so baskets can be re-priced.
pub struct ProductPriceChangedIntegrationEventHandler {
    watch: Arc<PriceWatch>,
}

impl ProductPriceChangedIntegrationEventHandler {
    pub fn new(watch: Arc<PriceWatch>) -> Self {
        Self { watch }
    }
}

#[async_trait]
impl IntegrationEventHandler<ProductPriceChangedIntegrationEvent>
    for ProductPriceChangedIntegrationEventHandler
{
    async fn handle(&self, event: ProductPriceChangedIntegrationEvent) -> anyhow::Result<()> {
        info!(
            event_id = %event.id(),
            app = APP_NAME,
            ?event,
            "Handling integration event"
        );
        info!(
            product_id = %event.product_id(),
            old_price = *event.old_price(),
            new_price = *event.new_price(),
            "Product price changed"
        );

        self.watch.record(
            *event.product_id(),
            PriceNotice {
                product_name: event.product_name().clone(),
                old_price: *event.old_price(),
                new_price: *event.new_price(),
                observed_at: event.creation_time(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eshop_core::ProductId;

    #[tokio::test]
    async fn records_the_new_price() {
        let watch = Arc::new(PriceWatch::new());
        let handler = ProductPriceChangedIntegrationEventHandler::new(watch.clone());
        let product_id = ProductId::new();

        handler
            .handle(ProductPriceChangedIntegrationEvent::new(
                product_id,
                "Kudu Purple Hoodie".to_string(),
                1250,
                1500,
            ))
            .await
            .unwrap();

        let notice = watch.latest(product_id).unwrap();
        assert_eq!(notice.product_name, "Kudu Purple Hoodie");
        assert_eq!((notice.old_price, notice.new_price), (1250, 1500));
    }

    #[tokio::test]
    async fn accepts_bodies_written_by_other_services() {
        let product_id = ProductId::new();
        let body = format!(
            r#"{{"Id":"6f1c4b7e-3f0a-4c55-9d43-2d4a8b0f1e11","CreationTime":"2024-05-01T10:00:00Z",
               "EventType":"Catalog.API.ProductPriceChangedIntegrationEvent",
               "ProductId":"{product_id}","ProductName":"Mug","OldPrice":850,"NewPrice":900}}"#
        );
        let event: ProductPriceChangedIntegrationEvent =
            eshop_events::codec::decode(body.as_bytes()).unwrap();

        let watch = Arc::new(PriceWatch::new());
        ProductPriceChangedIntegrationEventHandler::new(watch.clone())
            .handle(event)
            .await
            .unwrap();

        assert_eq!(watch.current_price(product_id, 850), 900);
    }
}
