//! Infrastructure layer: broker connectivity, the event bus engine, retry and
//! configuration.

pub mod config;
pub mod event_bus;
pub mod retry;


pub use config::{ConfigError, EventBusConfig};
pub use event_bus::{BrokerEventBus, ConnectionManager, EventBusError, InMemoryBroker};
pub use retry::RetryPolicy;
