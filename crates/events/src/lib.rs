//! Integration events: contract, wire codec, handlers and subscription bookkeeping.
//!
//! Pure mechanics (no broker IO). The broker-backed bus lives in `eshop-infra`.

pub mod bus;
pub mod codec;
pub mod event;
pub mod handler;
pub mod subscription;

pub use bus::{EventBus, Subscription};
pub use codec::CodecError;
pub use event::IntegrationEvent;
pub use handler::{
    HandlerKey, HandlerProvider, HandlerResolver, IntegrationEventHandler, ResolvedHandler,
};
pub use subscription::{
    DecodedEvent, DispatchError, DispatchPlan, EventDescriptor, HandlerFuture, RegistryError,
    SubscriptionInfo, SubscriptionKind, SubscriptionRegistry,
};

/// Re-exports used by [`integration_event!`]; not part of the public API.
#[doc(hidden)]
pub mod __private {
    pub use chrono::{DateTime, Utc};
    pub use uuid::Uuid;
}
