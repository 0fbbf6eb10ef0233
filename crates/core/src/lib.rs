//! `eshop-core`: shared building blocks for the eshop services.
//!
//! Pure primitives only (no IO, no broker, no async).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{OrderId, OrderItemId, ProductId};
