use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use eshop_core::{DomainError, DomainResult, ProductId};

use crate::integration_events::PriceChange;

/// A catalog product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    id: ProductId,
    name: String,
    description: String,
    category: String,
    /// Smallest currency unit (cents).
    price: u64,
    stock_quantity: u32,
    image_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

/// Full replacement of a product's editable fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateProduct {
    pub name: String,
    pub description: String,
    pub category: String,
    pub price: u64,
    pub stock_quantity: u32,
    pub image_url: Option<String>,
}

fn validate_name(name: &str) -> DomainResult<()> {
    if name.trim().is_empty() {
        return Err(DomainError::validation("product name cannot be empty"));
    }
    Ok(())
}

impl Product {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        category: impl Into<String>,
        price: u64,
        stock_quantity: u32,
    ) -> DomainResult<Self> {
        let name = name.into();
        validate_name(&name)?;

        Ok(Self {
            id: ProductId::new(),
            name,
            description: description.into(),
            category: category.into(),
            price,
            stock_quantity,
            image_url: None,
            created_at: Utc::now(),
            updated_at: None,
        })
    }

    pub fn id(&self) -> ProductId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn price(&self) -> u64 {
        self.price
    }

    pub fn stock_quantity(&self) -> u32 {
        self.stock_quantity
    }

    pub fn image_url(&self) -> Option<&str> {
        self.image_url.as_deref()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Apply `update` and report the price change, if any.
    ///
    /// Validation happens before any field is touched: on error the product
    /// is unchanged.
    pub fn update(&mut self, update: UpdateProduct) -> DomainResult<Option<PriceChange>> {
        validate_name(&update.name)?;

        let change = PriceChange::between(self.price, update.price);

        self.name = update.name;
        self.description = update.description;
        self.category = update.category;
        self.price = update.price;
        self.stock_quantity = update.stock_quantity;
        self.image_url = update.image_url;
        self.updated_at = Some(Utc::now());

        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hoodie() -> Product {
        Product::new(".NET Bot Black Hoodie", "Cotton hoodie", "Apparel", 1950, 100).unwrap()
    }

    fn update_with_price(product: &Product, price: u64) -> UpdateProduct {
        UpdateProduct {
            name: product.name().to_string(),
            description: product.description().to_string(),
            category: product.category().to_string(),
            price,
            stock_quantity: product.stock_quantity(),
            image_url: None,
        }
    }

    #[test]
    fn new_product_rejects_blank_name() {
        assert!(matches!(
            Product::new("  ", "", "Apparel", 100, 1),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn update_reports_price_change() {
        let mut product = hoodie();
        let update = update_with_price(&product, 2450);

        let change = product.update(update).unwrap();

        assert_eq!(
            change,
            Some(PriceChange {
                old_price: 1950,
                new_price: 2450
            })
        );
        assert_eq!(product.price(), 2450);
        assert!(product.updated_at().is_some());
    }

    #[test]
    fn update_without_price_change_reports_nothing() {
        let mut product = hoodie();
        let mut update = update_with_price(&product, 1950);
        update.stock_quantity = 3;

        assert_eq!(product.update(update).unwrap(), None);
        assert_eq!(product.stock_quantity(), 3);
    }

    #[test]
    fn invalid_update_leaves_product_untouched() {
        let mut product = hoodie();
        let before = product.clone();
        let mut update = update_with_price(&product, 5000);
        update.name = String::new();

        assert!(product.update(update).is_err());
        assert_eq!(product, before);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn change_is_reported_iff_price_differs(old in 0u64..1_000_000, new in 0u64..1_000_000) {
                let mut product = Product::new("Mug", "", "Kitchen", old, 1).unwrap();
                let update = update_with_price(&product, new);

                let change = product.update(update).unwrap();

                prop_assert_eq!(change.is_some(), old != new);
                prop_assert_eq!(product.price(), new);
                if let Some(change) = change {
                    prop_assert_eq!(change.old_price, old);
                    prop_assert_eq!(change.new_price, new);
                }
            }
        }
    }
}
