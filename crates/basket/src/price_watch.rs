use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use eshop_core::ProductId;

/// Latest known price change of a product, as seen by the basket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceNotice {
    pub product_name: String,
    pub old_price: u64,
    pub new_price: u64,
    pub observed_at: DateTime<Utc>,
}

/// Price changes received from the catalog, newest per product.
///
/// Baskets consult this to flag items whose price moved since they were added.
#[derive(Debug, Default)]
pub struct PriceWatch {
    notices: Mutex<HashMap<ProductId, PriceNotice>>,
}

impl PriceWatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, product_id: ProductId, notice: PriceNotice) {
        let mut notices = self
            .notices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Redelivered or reordered messages must not roll a price back.
        if notices
            .get(&product_id)
            .is_some_and(|existing| existing.observed_at > notice.observed_at)
        {
            return;
        }
        notices.insert(product_id, notice);
    }

    pub fn latest(&self, product_id: ProductId) -> Option<PriceNotice> {
        self.notices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&product_id)
            .cloned()
    }

    /// Current price of `product_id` if it changed, otherwise `basket_price`.
    pub fn current_price(&self, product_id: ProductId, basket_price: u64) -> u64 {
        self.latest(product_id)
            .map_or(basket_price, |notice| notice.new_price)
    }

    pub fn len(&self) -> usize {
        self.notices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
