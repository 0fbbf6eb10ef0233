//! Broker-backed integration event bus.
//!
//! - **Publish**: transient channel per call, durable direct exchange, JSON body,
//!   routing key = event name, persistent + mandatory, retried on transient
//!   failures.
//! - **Subscribe**: the service queue is bound to an event name the first time
//!   a handler subscribes to it; the registry does the rest.
//! - **Consume**: one supervisor task owns the consumer channel. It dispatches
//!   each delivery to the subscribed handlers in order, acks it exactly once,
//!   and opens a fresh channel whenever the current one dies.
//!
//! Nothing that goes wrong while processing a delivery (unknown event name,
//! undecodable body, unresolvable or failing handler) is retried or requeued:
//! it is logged and the message is acknowledged.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, instrument, warn};
use uuid::Uuid;

use eshop_events::codec;
use eshop_events::{
    EventBus, HandlerKey, HandlerResolver, IntegrationEvent, IntegrationEventHandler,
    SubscriptionRegistry,
};

use super::broker::{
    BrokerChannel, BrokerError, Delivery, DeliveryStream, PublishOptions, QueueOptions,
};
use super::connection::ConnectionManager;
use super::error::EventBusError;
use crate::config::EventBusConfig;
use crate::retry::{self, RetryError, RetryPolicy};

/// Integration event bus on top of a [`ConnectionManager`].
///
/// Dropping the bus stops its consumer; [`dispose`](Self::dispose) also waits
/// for it and clears the registry. The connection itself belongs to whoever
/// created the manager.
pub struct BrokerEventBus {
    inner: Arc<Inner>,
}

struct Inner {
    connection: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    resolver: Arc<dyn HandlerResolver>,
    exchange: String,
    queue: String,
    consumer_tag: String,
    retry: RetryPolicy,
    consumer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for BrokerEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerEventBus")
            .field("exchange", &self.inner.exchange)
            .field("queue", &self.inner.queue)
            .field("registry", &self.inner.registry)
            .finish()
    }
}

impl BrokerEventBus {
    pub fn new(
        connection: Arc<ConnectionManager>,
        registry: Arc<SubscriptionRegistry>,
        resolver: Arc<dyn HandlerResolver>,
        config: &EventBusConfig,
    ) -> Self {
        let consumer_tag = format!("{}.{}", config.queue, Uuid::new_v4().simple());
        Self {
            inner: Arc::new(Inner {
                connection,
                registry,
                resolver,
                exchange: config.exchange.clone(),
                queue: config.queue.clone(),
                consumer_tag,
                retry: config.retry_policy(),
                consumer: tokio::sync::Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.registry
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.inner.connection
    }

    pub fn exchange(&self) -> &str {
        &self.inner.exchange
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    /// Whether the consumer task is running.
    pub async fn is_consuming(&self) -> bool {
        self.inner
            .consumer
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Publish `event`, giving up early when `cancel` fires.
    ///
    /// Cancellation is observed while connecting and between publish attempts;
    /// a publish already handed to the broker is not recalled.
    #[instrument(
        skip_all,
        fields(event_name = E::NAME, event_id = %event.id()),
        err
    )]
    pub async fn publish_with_cancellation<E>(
        &self,
        event: &E,
        cancel: &CancellationToken,
    ) -> Result<(), EventBusError>
    where
        E: IntegrationEvent,
    {
        self.inner.publish(event, cancel).await
    }

    /// Stop consuming, close the consumer channel and forget all subscriptions.
    ///
    /// A delivery being processed is finished (and acked) first. Idempotent.
    pub async fn dispose(&self) {
        self.inner.shutdown.cancel();

        let consumer = self.inner.consumer.lock().await.take();
        if let Some(handle) = consumer {
            if let Err(err) = handle.await {
                error!(error = %err, "event bus consumer ended abnormally");
            }
        }

        self.inner.registry.clear();
        info!(queue = %self.inner.queue, "event bus disposed");
    }
}

impl Drop for BrokerEventBus {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

#[async_trait]
impl EventBus for BrokerEventBus {
    type Error = EventBusError;

    async fn publish<E>(&self, event: &E) -> Result<(), EventBusError>
    where
        E: IntegrationEvent,
    {
        self.publish_with_cancellation(event, &CancellationToken::new())
            .await
    }

    async fn subscribe<E, H>(&self) -> Result<(), EventBusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        if self.inner.shutdown.is_cancelled() {
            return Err(EventBusError::Disposed);
        }

        let event_name = E::NAME;
        if !self.inner.registry.has_subscriptions_for_event(event_name) {
            self.inner.bind(event_name).await?;
        }

        info!(
            event_name,
            handler = %HandlerKey::of::<H>(),
            "subscribing to event"
        );
        self.inner.registry.add_subscription::<E, H>()?;
        self.inner.ensure_consumer().await;
        Ok(())
    }

    fn unsubscribe<E, H>(&self)
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        info!(
            event_name = E::NAME,
            handler = %HandlerKey::of::<H>(),
            "unsubscribing from event"
        );
        self.inner.registry.remove_subscription::<E, H>();
    }
}

impl Inner {
    /// Connect unless connected. Returns early (with `Cancelled`) if `cancel` fires.
    async fn ensure_connected(&self, cancel: &CancellationToken) -> Result<(), EventBusError> {
        if self.connection.is_connected() {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(EventBusError::Cancelled),
            _ = self.connection.try_connect() => Ok(()),
        }
    }

    async fn publish<E>(&self, event: &E, cancel: &CancellationToken) -> Result<(), EventBusError>
    where
        E: IntegrationEvent,
    {
        if self.shutdown.is_cancelled() {
            return Err(EventBusError::Disposed);
        }
        if cancel.is_cancelled() {
            return Err(EventBusError::Cancelled);
        }

        self.ensure_connected(cancel).await?;
        let channel = self.connection.create_channel().await?;
        let result = self.publish_on(channel.as_ref(), event, cancel).await;
        if let Err(err) = channel.close().await {
            debug!(error = %err, "closing publish channel failed");
        }
        result
    }

    async fn publish_on<E>(
        &self,
        channel: &dyn BrokerChannel,
        event: &E,
        cancel: &CancellationToken,
    ) -> Result<(), EventBusError>
    where
        E: IntegrationEvent,
    {
        debug!("declaring event bus exchange to publish event");
        channel.declare_direct_exchange(&self.exchange, true).await?;

        let body = codec::encode(event)?;
        let options = PublishOptions::integration_event();

        debug!("publishing event to the broker");
        retry::run(
            &self.retry,
            "publish event",
            cancel,
            BrokerError::is_transient,
            || channel.publish(&self.exchange, E::NAME, &body, &options),
        )
        .await
        .map_err(|err| match err {
            RetryError::Cancelled => EventBusError::Cancelled,
            RetryError::Failed { error, .. } => error.into(),
        })
    }

    /// Declare exchange and queue, then bind the queue to `routing_key`.
    async fn bind(&self, routing_key: &str) -> Result<(), EventBusError> {
        self.ensure_connected(&self.shutdown).await?;
        let channel = self.connection.create_channel().await?;

        let result: Result<(), BrokerError> = async {
            channel.declare_direct_exchange(&self.exchange, true).await?;
            channel
                .declare_queue(&self.queue, QueueOptions::durable_shared())
                .await?;
            channel
                .bind_queue(&self.queue, &self.exchange, routing_key)
                .await
        }
        .await;

        if let Err(err) = channel.close().await {
            debug!(error = %err, "closing binding channel failed");
        }
        result?;

        debug!(queue = %self.queue, routing_key, "queue bound");
        Ok(())
    }

    async fn ensure_consumer(self: &Arc<Self>) {
        let mut consumer = self.consumer.lock().await;
        if consumer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        if self.shutdown.is_cancelled() {
            return;
        }

        let inner = Arc::clone(self);
        *consumer = Some(tokio::spawn(async move { inner.supervise().await }));
    }

    async fn open_consumer(&self) -> Result<(Box<dyn BrokerChannel>, DeliveryStream), EventBusError> {
        self.ensure_connected(&self.shutdown).await?;
        let channel = self.connection.create_channel().await?;

        let started: Result<DeliveryStream, BrokerError> = async {
            channel.declare_direct_exchange(&self.exchange, true).await?;
            channel
                .declare_queue(&self.queue, QueueOptions::durable_shared())
                .await?;
            channel.consume(&self.queue, &self.consumer_tag).await
        }
        .await;

        match started {
            Ok(deliveries) => Ok((channel, deliveries)),
            Err(err) => {
                let _ = channel.close().await;
                Err(err.into())
            }
        }
    }

    /// Consumer supervisor: the only code that creates or replaces the
    /// consumer channel.
    async fn supervise(self: Arc<Self>) {
        let mut failures = 0u32;

        while !self.shutdown.is_cancelled() && !self.connection.is_disposed() {
            let (channel, mut deliveries) = match self.open_consumer().await {
                Ok(consumer) => {
                    failures = 0;
                    consumer
                }
                Err(err) => {
                    failures += 1;
                    let delay = self
                        .retry
                        .delay_for_attempt(failures.min(self.retry.max_attempts));
                    warn!(
                        error = %err,
                        "could not start consuming, retrying in {:.1}s",
                        delay.as_secs_f64()
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            info!(queue = %self.queue, "starting event bus consumer");

            loop {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    next = deliveries.next() => match next {
                        Some(Ok(delivery)) => self.handle_delivery(channel.as_ref(), delivery).await,
                        Some(Err(err)) => {
                            warn!(error = %err, "consumer channel failed, recreating it");
                            break;
                        }
                        None => {
                            warn!("consumer channel closed, recreating it");
                            break;
                        }
                    },
                }
            }

            drop(deliveries);
            if let Err(err) = channel.close().await {
                debug!(error = %err, "closing consumer channel failed");
            }
        }

        debug!(queue = %self.queue, "event bus consumer stopped");
    }

    async fn handle_delivery(&self, channel: &dyn BrokerChannel, delivery: Delivery) {
        let event_name = delivery.routing_key.as_str();

        self.process_event(event_name, &delivery.body)
            .instrument(tracing::info_span!(
                "integration_event",
                event_name,
                delivery_tag = delivery.delivery_tag,
                redelivered = delivery.redelivered
            ))
            .await;

        if let Err(err) = channel.ack(delivery.delivery_tag).await {
            warn!(
                event_name,
                delivery_tag = delivery.delivery_tag,
                error = %err,
                "could not acknowledge message"
            );
        }
    }

    async fn process_event(&self, event_name: &str, body: &[u8]) {
        debug!("processing event");

        let Some(plan) = self.registry.dispatch_plan(event_name) else {
            warn!("no subscription for integration event");
            return;
        };

        let event = match plan.descriptor.decode(body) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "could not decode integration event");
                return;
            }
        };

        for subscription in &plan.subscriptions {
            let handler = subscription.handler();

            // Handler factories run here, on the consumer task.
            let prepared = panic::catch_unwind(AssertUnwindSafe(|| {
                self.resolver
                    .resolve(&handler)
                    .map(|instance| subscription.invoke(instance, &*event))
            }));

            let future = match prepared {
                Ok(Some(Ok(future))) => future,
                Ok(None) => {
                    debug!(handler = %handler, "handler not registered, skipping");
                    continue;
                }
                Ok(Some(Err(err))) => {
                    error!(handler = %handler, error = %err, "could not dispatch integration event");
                    continue;
                }
                Err(_) => {
                    error!(handler = %handler, "resolving integration event handler panicked");
                    continue;
                }
            };

            // Own task so a panicking handler cannot take the consumer down.
            match tokio::spawn(future.in_current_span()).await {
                Ok(Ok(())) => debug!(handler = %handler, "integration event handled"),
                Ok(Err(err)) => warn!(
                    handler = %handler,
                    error = %format_args!("{err:#}"),
                    "error processing integration event"
                ),
                Err(err) => error!(
                    handler = %handler,
                    error = %err,
                    "integration event handler panicked"
                ),
            }
        }
    }
}
