//! Catalog service: products, their prices, and the integration events the
//! catalog publishes when a price changes.

pub mod integration_events;
pub mod product;
pub mod service;

pub use integration_events::{PriceChange, ProductPriceChangedIntegrationEvent};
pub use product::{Product, UpdateProduct};
pub use service::{CatalogError, CatalogService};

/// Queue the catalog service consumes from (it currently subscribes to nothing).
pub const QUEUE: &str = "Catalog";
