use eshop_core::ProductId;

eshop_events::integration_event! {
    /// A catalog product changed price.
    pub struct ProductPriceChangedIntegrationEvent {
        product_id: ProductId,
        product_name: String,
        old_price: u64,
        new_price: u64,
    }
}
