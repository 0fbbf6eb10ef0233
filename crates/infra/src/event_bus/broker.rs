//! Broker seam: the handful of AMQP-style operations the event bus relies on.
//!
//! The bus only ever talks to these traits. `AmqpConnector` (feature `amqp`)
//! implements them over a real broker, `InMemoryBroker` implements them in
//! process for tests and local runs.
//!
//! ## Topology
//!
//! - one durable **direct** exchange shared by every service
//! - one durable, non-exclusive, non-auto-delete queue per service
//! - one binding per subscribed event name (routing key = event name)

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::Stream;

/// Failure reported by the broker or the transport underneath it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Message with routing key '{0}' could not be routed to any queue")]
    Unroutable(String),

    #[error("Broker protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Socket-level failures worth retrying; everything else is permanent for
    /// the operation that produced it.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Survives broker restarts and is shared by every instance of a service.
    pub fn durable_shared() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Per-message publish flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    pub persistent: bool,
    /// Unroutable messages are reported back instead of dropped.
    pub mandatory: bool,
    pub content_type: &'static str,
}

impl PublishOptions {
    /// Persistent, mandatory JSON: how every integration event goes out.
    pub fn integration_event() -> Self {
        Self {
            persistent: true,
            mandatory: true,
            content_type: "application/json",
        }
    }
}

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

/// Stream of deliveries for one consumer. It yields an error (or simply ends)
/// when the underlying channel dies; it never recovers by itself.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Connection-level events that require the connection to be replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// The connection was shut down by the broker or the network.
    Shutdown(String),
    /// The broker stopped accepting publishes on this connection.
    Blocked(String),
    /// A client-side callback on the connection failed.
    CallbackException(String),
}

impl fmt::Display for ConnectionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown(reason) => write!(f, "connection shutdown ({reason})"),
            Self::Blocked(reason) => write!(f, "connection blocked ({reason})"),
            Self::CallbackException(reason) => write!(f, "callback exception ({reason})"),
        }
    }
}

/// A signal tagged with the generation of the connection that raised it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEvent {
    pub generation: u64,
    pub signal: ConnectionSignal,
}

/// Handed to a [`Connector`] so the connection it opens can report trouble.
#[derive(Debug, Clone)]
pub struct SignalSender {
    generation: u64,
    tx: mpsc::UnboundedSender<SignalEvent>,
}

impl SignalSender {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<SignalEvent>) -> Self {
        Self { generation, tx }
    }

    /// A sender nobody listens to.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { generation: 0, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn send(&self, signal: ConnectionSignal) {
        // The receiver is gone once the owning manager is dropped.
        let _ = self.tx.send(SignalEvent {
            generation: self.generation,
            signal,
        });
    }
}

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, signals: SignalSender) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// A live connection. Channels are cheap and short-lived, connections are not.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    /// Where this connection points, for logs.
    fn endpoint(&self) -> String;

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A channel multiplexed over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Idempotent.
    async fn declare_direct_exchange(&self, name: &str, durable: bool) -> Result<(), BrokerError>;

    /// Idempotent.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: &PublishOptions,
    ) -> Result<(), BrokerError>;

    /// Start consuming `queue` with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unreachable_is_transient() {
        assert!(BrokerError::Unreachable("reset".into()).is_transient());
        assert!(!BrokerError::ChannelClosed("gone".into()).is_transient());
        assert!(!BrokerError::Unroutable("X".into()).is_transient());
        assert!(!BrokerError::Protocol("bad".into()).is_transient());
    }

    #[test]
    fn signals_carry_their_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = SignalSender::new(7, tx);

        sender.send(ConnectionSignal::Blocked("low disk".into()));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.generation, 7);
        assert_eq!(event.signal.to_string(), "connection blocked (low disk)");
    }

    #[test]
    fn detached_sender_drops_signals() {
        SignalSender::detached().send(ConnectionSignal::Shutdown("bye".into()));
    }
}
