use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

/// A fact that happened in one service and is relevant to others.
///
/// Integration events are:
/// - **immutable** (base fields are assigned once, at construction)
/// - **self-describing** (`event_type` carries the fully-qualified type name)
/// - **routed by name** (`NAME` is the simple type name and the broker routing key)
///
/// Declare variants with [`integration_event!`](crate::integration_event) rather
/// than implementing this trait by hand; the macro adds the base fields and the
/// camelCase wire representation.
pub trait IntegrationEvent:
    Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static
{
    /// Simple type name (e.g. `ProductPriceChangedIntegrationEvent`).
    const NAME: &'static str;

    /// Globally unique identity, assigned at construction.
    fn id(&self) -> Uuid;

    /// UTC creation time, assigned at construction.
    fn creation_time(&self) -> DateTime<Utc>;

    /// Fully-qualified type discriminator.
    fn event_type(&self) -> &str;
}

/// Declare an integration event variant.
///
/// Expands to a struct with private `id`, `creation_time` and `event_type`
/// fields followed by the declared domain fields, a `new` constructor taking the
/// domain fields in declaration order, one getter per domain field, and an
/// [`IntegrationEvent`] impl. The calling crate must depend on `serde` with the
/// `derive` feature.
///
/// ```ignore
/// integration_event! {
///     /// Raised when a product's price changes.
///     pub struct ProductPriceChangedIntegrationEvent {
///         product_id: ProductId,
///         old_price: u64,
///         new_price: u64,
///     }
/// }
/// ```
#[macro_export]
macro_rules! integration_event {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$fmeta:meta])*
                $field:ident : $ty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, ::serde::Serialize, ::serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        $vis struct $name {
            id: $crate::__private::Uuid,
            creation_time: $crate::__private::DateTime<$crate::__private::Utc>,
            event_type: ::std::string::String,
            $(
                $(#[$fmeta])*
                $field: $ty,
            )*
        }

        impl $name {
            #[allow(clippy::too_many_arguments)]
            pub fn new($($field: $ty),*) -> Self {
                Self {
                    id: $crate::__private::Uuid::new_v4(),
                    creation_time: $crate::__private::Utc::now(),
                    event_type: ::std::string::String::from(
                        ::core::concat!(::core::module_path!(), "::", ::core::stringify!($name)),
                    ),
                    $($field,)*
                }
            }

            $(
                pub fn $field(&self) -> &$ty {
                    &self.$field
                }
            )*
        }

        impl $crate::IntegrationEvent for $name {
            const NAME: &'static str = ::core::stringify!($name);

            fn id(&self) -> $crate::__private::Uuid {
                self.id
            }

            fn creation_time(&self) -> $crate::__private::DateTime<$crate::__private::Utc> {
                self.creation_time
            }

            fn event_type(&self) -> &str {
                &self.event_type
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::integration_event! {
        /// Test-only variant.
        pub struct StockReplenishedIntegrationEvent {
            sku: String,
            quantity: u32,
        }
    }

    #[test]
    fn constructor_assigns_base_fields() {
        let before = Utc::now();
        let event = StockReplenishedIntegrationEvent::new("SKU-1".into(), 12);

        assert!(!event.id().is_nil());
        assert!(event.creation_time() >= before);
        assert_eq!(event.sku(), "SKU-1");
        assert_eq!(*event.quantity(), 12);
    }

    #[test]
    fn name_is_simple_and_event_type_is_qualified() {
        let event = StockReplenishedIntegrationEvent::new("SKU-1".into(), 1);

        assert_eq!(
            StockReplenishedIntegrationEvent::NAME,
            "StockReplenishedIntegrationEvent"
        );
        assert!(event.event_type().ends_with("::StockReplenishedIntegrationEvent"));
        assert!(event.event_type().starts_with("eshop_events"));
    }

    #[test]
    fn each_event_gets_a_fresh_identity() {
        let a = StockReplenishedIntegrationEvent::new("SKU-1".into(), 1);
        let b = StockReplenishedIntegrationEvent::new("SKU-1".into(), 1);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn wire_fields_are_camel_case() {
        let event = StockReplenishedIntegrationEvent::new("SKU-1".into(), 3);
        let json = serde_json::to_value(&event).unwrap();

        assert!(json.get("id").is_some());
        assert!(json.get("creationTime").is_some());
        assert!(json.get("eventType").is_some());
        assert_eq!(json["sku"], "SKU-1");
        assert_eq!(json["quantity"], 3);
    }
}
