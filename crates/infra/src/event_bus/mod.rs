//! Broker-backed integration event bus.
//!
//! The event bus contract and subscription bookkeeping live in `eshop-events`
//! as pure mechanics. This module adds the broker side: the connection
//! lifecycle, the publish/consume engine and the broker implementations
//! (in-memory, and RabbitMQ behind the `amqp` feature).

pub mod broker;
pub mod connection;
pub mod engine;
pub mod error;
pub mod in_memory;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use broker::{
    BrokerChannel, BrokerConnection, BrokerError, ConnectionSignal, Connector, Delivery,
    DeliveryStream, PublishOptions, QueueOptions, SignalEvent, SignalSender,
};
pub use connection::{ConnectionManager, ConnectionState};
pub use engine::BrokerEventBus;
pub use error::EventBusError;
pub use in_memory::{InMemoryBroker, PublishedMessage};

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
