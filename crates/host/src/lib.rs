//! `eshop-host`: runs the integration event wiring of one service.
//!
//! A host owns the broker connection and the event bus for its service,
//! registers the service's handlers and startup subscriptions, and tears
//! everything down on [`ServiceHost::shutdown`].

use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use eshop_basket::PriceWatch;
use eshop_catalog::CatalogService;
use eshop_events::{HandlerProvider, SubscriptionRegistry};
use eshop_infra::event_bus::Connector;
use eshop_infra::{BrokerEventBus, ConnectionManager, EventBusConfig};
use eshop_ordering::{InMemoryOrderBook, OrderBook};

/// Environment variable selecting the service to host.
pub const SERVICE_VAR: &str = "ESHOP_SERVICE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Catalog,
    Basket,
    Ordering,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown service '{0}' (expected catalog, basket or ordering)")]
pub struct UnknownService(String);

impl FromStr for Service {
    type Err = UnknownService;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "catalog" => Ok(Self::Catalog),
            "basket" => Ok(Self::Basket),
            "ordering" => Ok(Self::Ordering),
            _ => Err(UnknownService(value.to_string())),
        }
    }
}

impl core::fmt::Display for Service {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.queue())
    }
}

impl Service {
    /// The service's queue on the shared exchange.
    pub fn queue(&self) -> &'static str {
        match self {
            Self::Catalog => eshop_catalog::QUEUE,
            Self::Basket => eshop_basket::QUEUE,
            Self::Ordering => eshop_ordering::QUEUE,
        }
    }

    /// Whether the service consumes events (and therefore needs a queue).
    pub fn subscribes(&self) -> bool {
        !matches!(self, Self::Catalog)
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let value = std::env::var(SERVICE_VAR)
            .map_err(|_| anyhow::anyhow!("{SERVICE_VAR} must be set to catalog, basket or ordering"))?;
        Ok(value.parse()?)
    }
}

/// Service-side collaborators the handlers write into.
pub enum ServiceState {
    Catalog(Arc<CatalogService<BrokerEventBus>>),
    Basket(Arc<PriceWatch>),
    Ordering(Arc<dyn OrderBook>),
}

pub struct ServiceHost {
    service: Service,
    connection: Arc<ConnectionManager>,
    bus: Arc<BrokerEventBus>,
    state: ServiceState,
}

impl ServiceHost {
    /// Connect, register handlers and run the startup subscriptions.
    ///
    /// An empty configured queue falls back to the service's own queue.
    pub async fn start(
        service: Service,
        config: &EventBusConfig,
        connector: Arc<dyn Connector>,
    ) -> anyhow::Result<Self> {
        let mut config = config.clone();
        if config.queue.trim().is_empty() {
            config.queue = service.queue().to_string();
        }
        if service.subscribes() {
            config.validate_for_consumer()?;
        } else {
            config.validate()?;
        }

        let connection = ConnectionManager::new(connector, config.retry_policy());
        if !connection.try_connect().await {
            warn!(service = %service, "broker unreachable at startup");
        }

        let mut provider = HandlerProvider::new();
        let watch = Arc::new(PriceWatch::new());
        let book: Arc<dyn OrderBook> = Arc::new(InMemoryOrderBook::new());
        match service {
            Service::Catalog => {}
            Service::Basket => eshop_basket::register_handlers(&mut provider, watch.clone()),
            Service::Ordering => eshop_ordering::register_handlers(&mut provider, book.clone()),
        }

        let bus = Arc::new(BrokerEventBus::new(
            connection.clone(),
            Arc::new(SubscriptionRegistry::new()),
            Arc::new(provider),
            &config,
        ));

        let state = match service {
            Service::Catalog => ServiceState::Catalog(Arc::new(CatalogService::new(bus.clone()))),
            Service::Basket => {
                eshop_basket::register_subscriptions(bus.as_ref()).await?;
                ServiceState::Basket(watch)
            }
            Service::Ordering => {
                eshop_ordering::register_subscriptions(bus.as_ref()).await?;
                ServiceState::Ordering(book)
            }
        };

        info!(
            service = %service,
            exchange = %config.exchange,
            queue = %config.queue,
            "service host started"
        );

        Ok(Self {
            service,
            connection,
            bus,
            state,
        })
    }

    pub fn service(&self) -> Service {
        self.service
    }

    pub fn bus(&self) -> &Arc<BrokerEventBus> {
        &self.bus
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn state(&self) -> &ServiceState {
        &self.state
    }

    /// Stop consuming, then close the broker connection.
    pub async fn shutdown(self) {
        self.bus.dispose().await;
        self.connection.dispose().await;
        info!(service = %self.service, "service host stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use eshop_catalog::{Product, UpdateProduct};
    use eshop_core::ProductId;
    use eshop_infra::InMemoryBroker;
    use eshop_infra::config::DEFAULT_EXCHANGE;

    #[test]
    fn service_names_are_case_insensitive() {
        assert_eq!("Basket".parse::<Service>(), Ok(Service::Basket));
        assert_eq!(" ordering ".parse::<Service>(), Ok(Service::Ordering));
        assert_eq!("CATALOG".parse::<Service>(), Ok(Service::Catalog));
        assert!("identity".parse::<Service>().is_err());
    }

    #[test]
    fn only_consumers_subscribe() {
        assert!(!Service::Catalog.subscribes());
        assert!(Service::Basket.subscribes());
        assert_eq!(Service::Ordering.queue(), "Ordering");
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn basket_binds_its_queue_at_startup() {
        let broker = InMemoryBroker::new();

        let host = ServiceHost::start(
            Service::Basket,
            &EventBusConfig::default(),
            Arc::new(broker.clone()),
        )
        .await
        .unwrap();

        assert_eq!(host.bus().queue(), "Basket");
        assert_eq!(
            broker.bindings("Basket", DEFAULT_EXCHANGE),
            vec!["ProductPriceChangedIntegrationEvent".to_string()]
        );
        host.shutdown().await;
    }

    #[tokio::test]
    async fn catalog_price_change_reaches_the_basket() {
        let broker = InMemoryBroker::new();
        let basket = ServiceHost::start(
            Service::Basket,
            &EventBusConfig::default(),
            Arc::new(broker.clone()),
        )
        .await
        .unwrap();
        let catalog = ServiceHost::start(
            Service::Catalog,
            &EventBusConfig::default(),
            Arc::new(broker.clone()),
        )
        .await
        .unwrap();

        let ServiceState::Catalog(products) = catalog.state() else {
            panic!("catalog host without catalog state");
        };
        let ServiceState::Basket(watch) = basket.state() else {
            panic!("basket host without price watch");
        };
        let id: ProductId =
            products.add_product(Product::new("Mug", "Ceramic", "Kitchen", 850, 10).unwrap());

        products
            .update_product(
                id,
                UpdateProduct {
                    name: "Mug".to_string(),
                    description: "Ceramic".to_string(),
                    category: "Kitchen".to_string(),
                    price: 900,
                    stock_quantity: 10,
                    image_url: None,
                },
            )
            .await
            .unwrap();

        let watch = watch.clone();
        assert!(eventually(|| watch.latest(id).is_some()).await);
        assert_eq!(watch.current_price(id, 850), 900);

        catalog.shutdown().await;
        basket.shutdown().await;
    }

    #[tokio::test]
    async fn checkout_places_an_order() {
        let broker = InMemoryBroker::new();
        let ordering = ServiceHost::start(
            Service::Ordering,
            &EventBusConfig::default(),
            Arc::new(broker.clone()),
        )
        .await
        .unwrap();
        let ServiceState::Ordering(book) = ordering.state() else {
            panic!("ordering host without order book");
        };

        let body = serde_json::json!({
            "userName": "alice",
            "customerName": "Alice",
            "customerEmail": "alice@example.com",
            "shippingAddress": "1 Main St",
            "totalPrice": 1700,
            "items": [{
                "productId": ProductId::new(),
                "productName": "Mug",
                "quantity": 2,
                "price": 850
            }],
            "id": "2f7a3c1e-8d4b-4f6a-9c2e-1b5d7e9f0a3c",
            "creationTime": "2024-05-01T10:00:00Z",
            "eventType": "BasketCheckoutIntegrationEvent"
        });
        broker.publish_raw(
            DEFAULT_EXCHANGE,
            "BasketCheckoutIntegrationEvent",
            serde_json::to_vec(&body).unwrap(),
        )
        .unwrap();

        let book = book.clone();
        assert!(eventually(|| book.list().len() == 1).await);
        assert_eq!(book.list()[0].customer_name(), "Alice");

        ordering.shutdown().await;
    }
}
