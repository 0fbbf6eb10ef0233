//! Product maintenance for the catalog service.
//!
//! The service owns an in-memory product table and publishes a
//! [`ProductPriceChangedIntegrationEvent`] after each update that changed a
//! price. The update is kept even if publishing fails; the caller gets
//! [`CatalogError::Publish`] and decides whether to retry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{info, instrument};

use eshop_core::{DomainError, ProductId};
use eshop_events::EventBus;

use crate::integration_events::ProductPriceChangedIntegrationEvent;
use crate::product::{Product, UpdateProduct};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("product {0} not found")]
    NotFound(ProductId),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("failed to publish integration event: {0}")]
    Publish(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub struct CatalogService<B> {
    products: RwLock<HashMap<ProductId, Product>>,
    bus: Arc<B>,
}

impl<B: EventBus> CatalogService<B> {
    pub fn new(bus: Arc<B>) -> Self {
        Self {
            products: RwLock::new(HashMap::new()),
            bus,
        }
    }

    pub fn add_product(&self, product: Product) -> ProductId {
        let id = product.id();
        self.products
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, product);
        id
    }

    pub fn product(&self, id: ProductId) -> Option<Product> {
        self.products
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .cloned()
    }

    #[instrument(skip(self, update), fields(product_id = %id))]
    pub async fn update_product(
        &self,
        id: ProductId,
        update: UpdateProduct,
    ) -> Result<Product, CatalogError> {
        let (product, event) = {
            let mut products = self
                .products
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let product = products.get_mut(&id).ok_or(CatalogError::NotFound(id))?;
            let change = product.update(update)?;
            let event: Option<ProductPriceChangedIntegrationEvent> =
                change.map(|change| change.into_event(product.id(), product.name()));
            (product.clone(), event)
        };

        if let Some(event) = event {
            info!(
                old_price = *event.old_price(),
                new_price = *event.new_price(),
                "Publishing price change for {}",
                product.name()
            );
            self.bus
                .publish(&event)
                .await
                .map_err(|err| CatalogError::Publish(Box::new(err)))?;
        }

        Ok(product)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use eshop_events::{IntegrationEvent, IntegrationEventHandler};

    #[derive(Debug, Error)]
    #[error("broker unreachable")]
    struct BusDown;

    #[derive(Default)]
    struct RecordingBus {
        published: Mutex<Vec<(&'static str, serde_json::Value)>>,
        down: AtomicBool,
    }

    impl RecordingBus {
        fn published(&self) -> Vec<(&'static str, serde_json::Value)> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventBus for RecordingBus {
        type Error = BusDown;

        async fn publish<E>(&self, event: &E) -> Result<(), BusDown>
        where
            E: IntegrationEvent,
        {
            if self.down.load(Ordering::SeqCst) {
                return Err(BusDown);
            }
            self.published
                .lock()
                .unwrap()
                .push((E::NAME, serde_json::to_value(event).unwrap()));
            Ok(())
        }

        async fn subscribe<E, H>(&self) -> Result<(), BusDown>
        where
            E: IntegrationEvent,
            H: IntegrationEventHandler<E>,
        {
            Ok(())
        }

        fn unsubscribe<E, H>(&self)
        where
            E: IntegrationEvent,
            H: IntegrationEventHandler<E>,
        {
        }
    }

    fn service_with_hoodie() -> (Arc<RecordingBus>, CatalogService<RecordingBus>, ProductId) {
        let bus = Arc::new(RecordingBus::default());
        let service = CatalogService::new(bus.clone());
        let id = service.add_product(
            Product::new(".NET Bot Black Hoodie", "Cotton hoodie", "Apparel", 1950, 100).unwrap(),
        );
        (bus, service, id)
    }

    fn update(price: u64) -> UpdateProduct {
        UpdateProduct {
            name: ".NET Bot Black Hoodie".to_string(),
            description: "Cotton hoodie".to_string(),
            category: "Apparel".to_string(),
            price,
            stock_quantity: 100,
            image_url: None,
        }
    }

    #[tokio::test]
    async fn price_change_is_published() {
        let (bus, service, id) = service_with_hoodie();

        let product = service.update_product(id, update(2450)).await.unwrap();

        assert_eq!(product.price(), 2450);
        let published = bus.published();
        assert_eq!(published.len(), 1);
        let (name, body) = &published[0];
        assert_eq!(*name, "ProductPriceChangedIntegrationEvent");
        assert_eq!(body["productId"], id.to_string());
        assert_eq!(body["oldPrice"], 1950);
        assert_eq!(body["newPrice"], 2450);
    }

    #[tokio::test]
    async fn same_price_publishes_nothing() {
        let (bus, service, id) = service_with_hoodie();

        service.update_product(id, update(1950)).await.unwrap();

        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn unknown_product_is_not_found() {
        let (bus, service, _) = service_with_hoodie();
        let missing = ProductId::new();

        let err = service.update_product(missing, update(10)).await.unwrap_err();

        assert!(matches!(err, CatalogError::NotFound(id) if id == missing));
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn invalid_update_is_rejected_without_publishing() {
        let (bus, service, id) = service_with_hoodie();
        let mut invalid = update(5000);
        invalid.name = " ".to_string();

        let err = service.update_product(id, invalid).await.unwrap_err();

        assert!(matches!(err, CatalogError::Domain(DomainError::Validation(_))));
        assert_eq!(service.product(id).unwrap().price(), 1950);
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_keeps_the_update() {
        let (bus, service, id) = service_with_hoodie();
        bus.down.store(true, Ordering::SeqCst);

        let err = service.update_product(id, update(2450)).await.unwrap_err();

        assert!(matches!(err, CatalogError::Publish(_)));
        assert_eq!(service.product(id).unwrap().price(), 2450);
    }
}
