//! Event bus abstraction (publish/subscribe contract, mechanics only).
//!
//! Services program against [`EventBus`]; the broker-backed engine lives in
//! `eshop-infra`. The contract is deliberately small:
//!
//! - `publish` hands an event to the transport, routed by the event's name
//! - `subscribe::<E, H>()` registers handler type `H` for event type `E`
//! - `unsubscribe::<E, H>()` stops invoking `H`, nothing else
//!
//! Delivery is at-least-once on the wire and at-most-one processing attempt per
//! delivery on the consumer side: handler failures are logged, never retried.

use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryIter, TryRecvError};
use std::time::Duration;

use async_trait::async_trait;

use crate::{IntegrationEvent, IntegrationEventHandler};

/// Receiving side of an in-process notification stream.
///
/// Subscriptions are designed for single-threaded consumption. Each subscription
/// should be used by one thread (or use a mutex/channel to fan out further).
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain whatever is already queued.
    pub fn try_iter(&self) -> TryIter<'_, M> {
        self.receiver.try_iter()
    }
}

/// Integration event bus.
///
/// Implementations must be safe to share across tasks; publishing may happen
/// concurrently with the consumption of incoming events.
#[async_trait]
pub trait EventBus: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn publish<E>(&self, event: &E) -> Result<(), Self::Error>
    where
        E: IntegrationEvent;

    async fn subscribe<E, H>(&self) -> Result<(), Self::Error>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>;

    fn unsubscribe<E, H>(&self)
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>;
}
