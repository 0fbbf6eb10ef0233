//! In-process broker implementing the broker seam.
//!
//! Models the parts of AMQP the event bus depends on:
//! - direct exchanges, durable queues and routing-key bindings
//! - round-robin delivery to consumers with manual acknowledgement
//! - unacknowledged messages are requeued (flagged `redelivered`) when their
//!   channel goes away
//! - mandatory publishes with no matching binding fail with `Unroutable`
//!
//! It also lets tests break things on purpose: refuse connections, fail
//! publishes, shut down or block connections, and raise callback or channel
//! exceptions.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::broker::{
    BrokerChannel, BrokerConnection, BrokerError, ConnectionSignal, Connector, Delivery,
    DeliveryStream, PublishOptions, QueueOptions, SignalSender,
};

/// A message accepted by an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub options: PublishOptions,
}

#[derive(Clone)]
struct Message {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

struct Consumer {
    channel: u64,
    sender: mpsc::UnboundedSender<Result<Delivery, BrokerError>>,
}

struct Queue {
    options: QueueOptions,
    /// (exchange, routing key)
    bindings: BTreeSet<(String, String)>,
    ready: VecDeque<Message>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

impl Queue {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            bindings: BTreeSet::new(),
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }
}

struct Unacked {
    queue: String,
    channel: u64,
    message: Message,
}

/// Only open connections and channels are tracked; closing one forgets it.
struct ConnectionEntry {
    signals: SignalSender,
}

struct ChannelEntry {
    connection: u64,
}

struct BrokerState {
    reachable: bool,
    connect_failures: VecDeque<BrokerError>,
    publish_failures: VecDeque<BrokerError>,
    connect_attempts: u32,
    next_id: u64,
    next_delivery_tag: u64,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
    /// name -> durable
    exchanges: HashMap<String, bool>,
    queues: HashMap<String, Queue>,
    unacked: HashMap<u64, Unacked>,
    published: Vec<PublishedMessage>,
    acked: Vec<u64>,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            reachable: true,
            connect_failures: VecDeque::new(),
            publish_failures: VecDeque::new(),
            connect_attempts: 0,
            next_id: 0,
            next_delivery_tag: 0,
            connections: HashMap::new(),
            channels: HashMap::new(),
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            unacked: HashMap::new(),
            published: Vec::new(),
            acked: Vec::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn connection_open(&self, connection: u64) -> bool {
        self.connections.contains_key(&connection)
    }

    fn check_channel(&self, channel: u64) -> Result<(), BrokerError> {
        match self.channels.get(&channel) {
            Some(entry) if self.connection_open(entry.connection) => Ok(()),
            Some(_) => Err(BrokerError::Unreachable("connection is closed".to_string())),
            None => Err(BrokerError::ChannelClosed(format!(
                "channel {channel} is closed"
            ))),
        }
    }

    fn close_connection(
        &mut self,
        connection: u64,
        error: Option<BrokerError>,
    ) -> Option<ConnectionEntry> {
        let entry = self.connections.remove(&connection)?;

        let mut channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        channels.sort_unstable();
        for channel in channels {
            self.close_channel(channel, error.clone());
        }
        Some(entry)
    }

    /// Close `channel`, detach its consumers (reporting `error` to them, if any)
    /// and requeue what they had not acknowledged.
    fn close_channel(&mut self, channel: u64, error: Option<BrokerError>) {
        if self.channels.remove(&channel).is_none() {
            return;
        }

        let mut touched = BTreeSet::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|consumer| {
                if consumer.channel != channel {
                    return true;
                }
                if let Some(error) = &error {
                    let _ = consumer.sender.send(Err(error.clone()));
                }
                false
            });
            if queue.consumers.len() != before {
                touched.insert(name.clone());
            }
        }

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            let Some(unacked) = self.unacked.remove(&tag) else {
                continue;
            };
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.ready.push_front(Message {
                    redelivered: true,
                    ..unacked.message
                });
                touched.insert(unacked.queue);
            }
        }

        for name in touched {
            self.dispatch(&name);
        }
    }

    /// Hand ready messages of `queue_name` to its consumers, round-robin.
    fn dispatch(&mut self, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.consumers.is_empty() {
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            let index = queue.next_consumer % queue.consumers.len();
            self.next_delivery_tag += 1;
            let delivery = Delivery {
                delivery_tag: self.next_delivery_tag,
                routing_key: message.routing_key.clone(),
                body: message.body.clone(),
                redelivered: message.redelivered,
            };

            let consumer = &queue.consumers[index];
            if consumer.sender.send(Ok(delivery)).is_err() {
                // Receiver dropped without closing its channel.
                queue.consumers.remove(index);
                queue.ready.push_front(message);
                continue;
            }

            queue.next_consumer = index + 1;
            self.unacked.insert(
                self.next_delivery_tag,
                Unacked {
                    queue: queue_name.to_owned(),
                    channel: consumer.channel,
                    message,
                },
            );
        }
    }

    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: &PublishOptions,
    ) -> Result<(), BrokerError> {
        if !self.exchanges.contains_key(exchange) {
            return Err(BrokerError::Protocol(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }

        let binding = (exchange.to_owned(), routing_key.to_owned());
        let mut targets: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.bindings.contains(&binding))
            .map(|(name, _)| name.clone())
            .collect();
        targets.sort();

        if targets.is_empty() && options.mandatory {
            return Err(BrokerError::Unroutable(routing_key.to_owned()));
        }

        self.published.push(PublishedMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body: body.to_vec(),
            options: options.clone(),
        });

        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.ready.push_back(Message {
                    routing_key: routing_key.to_owned(),
                    body: body.to_vec(),
                    redelivered: false,
                });
            }
            self.dispatch(&name);
        }

        Ok(())
    }

    fn bind(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        if !self.exchanges.contains_key(exchange) {
            return Err(BrokerError::Protocol(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        let queue = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::Protocol(format!("NOT_FOUND - no queue '{queue}'")))?;
        queue
            .bindings
            .insert((exchange.to_owned(), routing_key.to_owned()));
        Ok(())
    }
}

struct Shared {
    state: Mutex<BrokerState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process broker. Clones share the same state.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("InMemoryBroker")
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .field("connections", &state.connections.len())
            .finish()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::new()),
            }),
        }
    }

    // --- fault injection ---

    /// While unreachable, every connection attempt fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.lock().reachable = reachable;
    }

    /// Fail the next `count` connection attempts with a transient error.
    pub fn fail_next_connects(&self, count: usize) {
        let mut state = self.shared.lock();
        for _ in 0..count {
            state
                .connect_failures
                .push_back(BrokerError::Unreachable("connection refused".to_string()));
        }
    }

    /// Fail the next `count` publishes with a transient error.
    pub fn fail_next_publishes(&self, count: usize) {
        let mut state = self.shared.lock();
        for _ in 0..count {
            state
                .publish_failures
                .push_back(BrokerError::Unreachable("connection reset by peer".to_string()));
        }
    }

    /// Fail the next publish with `error`.
    pub fn fail_next_publish_with(&self, error: BrokerError) {
        self.shared.lock().publish_failures.push_back(error);
    }

    /// Drop every open connection and raise a shutdown signal for each.
    pub fn shutdown_connections(&self, reason: &str) {
        let mut state = self.shared.lock();
        let mut open: Vec<u64> = state.connections.keys().copied().collect();
        open.sort_unstable();

        for id in open {
            let closed = state.close_connection(
                id,
                Some(BrokerError::ChannelClosed(format!("connection shutdown: {reason}"))),
            );
            if let Some(entry) = closed {
                entry
                    .signals
                    .send(ConnectionSignal::Shutdown(reason.to_owned()));
            }
        }
    }

    /// Raise a blocked signal on every open connection; the connections stay open.
    pub fn block_connections(&self, reason: &str) {
        let state = self.shared.lock();
        for entry in state.connections.values() {
            entry
                .signals
                .send(ConnectionSignal::Blocked(reason.to_owned()));
        }
    }

    /// Report a failed client callback on every open connection; the
    /// connections stay open.
    pub fn raise_callback_exception(&self, reason: &str) {
        let state = self.shared.lock();
        for entry in state.connections.values() {
            entry
                .signals
                .send(ConnectionSignal::CallbackException(reason.to_owned()));
        }
    }

    /// Kill every channel consuming from `queue` with a channel exception.
    pub fn raise_channel_exception(&self, queue: &str) {
        let mut state = self.shared.lock();
        let mut channels: Vec<u64> = state
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|consumer| consumer.channel).collect())
            .unwrap_or_default();
        channels.sort_unstable();
        channels.dedup();

        for channel in channels {
            debug!(channel, queue, "raising channel exception");
            state.close_channel(
                channel,
                Some(BrokerError::ChannelClosed("channel exception".to_string())),
            );
        }
    }

    // --- direct manipulation ---

    /// Declare a durable direct exchange and a durable shared queue, then bind.
    pub fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        state.exchanges.entry(exchange.to_owned()).or_insert(true);
        state
            .queues
            .entry(queue.to_owned())
            .or_insert_with(|| Queue::new(QueueOptions::durable_shared()));
        state.bind(queue, exchange, routing_key)
    }

    /// Publish a raw body as another producer would (persistent, not mandatory).
    pub fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), BrokerError> {
        let options = PublishOptions {
            mandatory: false,
            ..PublishOptions::integration_event()
        };
        self.shared
            .lock()
            .route(exchange, routing_key, &body.into(), &options)
    }

    // --- inspection ---

    pub fn connect_attempts(&self) -> u32 {
        self.shared.lock().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.shared.lock().connections.len()
    }

    pub fn open_channels(&self) -> usize {
        self.shared.lock().channels.len()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.shared.lock().exchanges.contains_key(name)
    }

    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.shared.lock().queues.get(name).map(|queue| queue.options)
    }

    /// Routing keys bound from `exchange` to `queue`, sorted.
    pub fn bindings(&self, queue: &str, exchange: &str) -> Vec<String> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| {
                q.bindings
                    .iter()
                    .filter(|(bound_exchange, _)| bound_exchange == exchange)
                    .map(|(_, key)| key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self) -> usize {
        self.shared.lock().unacked.len()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.lock().published.clone()
    }

    /// Delivery tags in acknowledgement order.
    pub fn acked(&self) -> Vec<u64> {
        self.shared.lock().acked.clone()
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(
        &self,
        signals: SignalSender,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let id = {
            let mut state = self.shared.lock();
            state.connect_attempts += 1;
            if let Some(error) = state.connect_failures.pop_front() {
                return Err(error);
            }
            if !state.reachable {
                return Err(BrokerError::Unreachable("connection refused".to_string()));
            }
            let id = state.next_id();
            state
                .connections
                .insert(id, ConnectionEntry { signals });
            id
        };

        debug!(connection = id, "in-memory broker accepted connection");
        Ok(Arc::new(InMemoryConnection {
            id,
            shared: self.shared.clone(),
        }))
    }
}

struct InMemoryConnection {
    id: u64,
    shared: Arc<Shared>,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    fn is_open(&self) -> bool {
        self.shared.lock().connection_open(self.id)
    }

    fn endpoint(&self) -> String {
        format!("memory://connection-{}", self.id)
    }

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let id = {
            let mut state = self.shared.lock();
            if !state.connection_open(self.id) {
                return Err(BrokerError::Unreachable("connection is closed".to_string()));
            }
            let id = state.next_id();
            state
                .channels
                .insert(id, ChannelEntry { connection: self.id });
            id
        };

        Ok(Box::new(InMemoryChannel {
            id,
            shared: self.shared.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shared.lock().close_connection(self.id, None);
        Ok(())
    }
}

struct InMemoryChannel {
    id: u64,
    shared: Arc<Shared>,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    fn is_open(&self) -> bool {
        self.shared.lock().check_channel(self.id).is_ok()
    }

    async fn declare_direct_exchange(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        state.check_channel(self.id)?;
        state.exchanges.entry(name.to_owned()).or_insert(durable);
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        state.check_channel(self.id)?;
        state
            .queues
            .entry(name.to_owned())
            .or_insert_with(|| Queue::new(options));
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        state.check_channel(self.id)?;
        state.bind(queue, exchange, routing_key)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        options: &PublishOptions,
    ) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        state.check_channel(self.id)?;
        if let Some(error) = state.publish_failures.pop_front() {
            return Err(error);
        }
        state.route(exchange, routing_key, body, options)
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.shared.lock();
        state.check_channel(self.id)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::Protocol(format!("NOT_FOUND - no queue '{queue}'")))?
            .consumers
            .push(Consumer {
                channel: self.id,
                sender,
            });
        state.dispatch(queue);

        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        state.check_channel(self.id)?;

        match state.unacked.get(&delivery_tag) {
            Some(unacked) if unacked.channel == self.id => {
                state.unacked.remove(&delivery_tag);
                state.acked.push(delivery_tag);
                Ok(())
            }
            _ => Err(BrokerError::Protocol(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            ))),
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shared.lock().close_channel(self.id, None);
        Ok(())
    }
}
