//! Integration events published by the catalog.

use eshop_core::ProductId;

eshop_events::integration_event! {
    /// Published after a product's price was updated.
    pub struct ProductPriceChangedIntegrationEvent {
        product_id: ProductId,
        product_name: String,
        /// Smallest currency unit (cents).
        old_price: u64,
        /// Smallest currency unit (cents).
        new_price: u64,
    }
}

/// A price update worth telling other services about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceChange {
    pub old_price: u64,
    pub new_price: u64,
}

impl PriceChange {
    /// `None` when the price did not actually change.
    pub fn between(old_price: u64, new_price: u64) -> Option<Self> {
        (old_price != new_price).then_some(Self {
            old_price,
            new_price,
        })
    }

    pub fn is_increase(&self) -> bool {
        self.new_price > self.old_price
    }

    pub fn into_event(
        self,
        product_id: ProductId,
        product_name: impl Into<String>,
    ) -> ProductPriceChangedIntegrationEvent {
        ProductPriceChangedIntegrationEvent::new(
            product_id,
            product_name.into(),
            self.old_price,
            self.new_price,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eshop_events::IntegrationEvent;

    #[test]
    fn unchanged_price_is_not_a_change() {
        assert_eq!(PriceChange::between(1950, 1950), None);
        assert!(PriceChange::between(1950, 2450).unwrap().is_increase());
        assert!(!PriceChange::between(2450, 1950).unwrap().is_increase());
    }

    #[test]
    fn event_is_routed_by_its_simple_name() {
        assert_eq!(
            ProductPriceChangedIntegrationEvent::NAME,
            "ProductPriceChangedIntegrationEvent"
        );
    }

    #[test]
    fn wire_format_matches_other_services() {
        let product_id = ProductId::new();
        let event = PriceChange::between(1950, 2450)
            .unwrap()
            .into_event(product_id, ".NET Bot Black Hoodie");

        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["productId"], product_id.to_string());
        assert_eq!(json["productName"], ".NET Bot Black Hoodie");
        assert_eq!(json["oldPrice"], 1950);
        assert_eq!(json["newPrice"], 2450);
        assert!(json.get("creationTime").is_some());
        assert!(
            json["eventType"]
                .as_str()
                .unwrap()
                .ends_with("integration_events::ProductPriceChangedIntegrationEvent")
        );
    }
}
