//! Broker connection lifecycle.
//!
//! [`ConnectionManager`] owns at most one live connection and hands out
//! channels on it. Connecting runs under an async mutex so concurrent callers
//! never race to open two connections.
//!
//! Connection trouble (shutdown, blocked, callback exception) arrives as
//! [`SignalEvent`]s on an mpsc channel drained by a background task. That task
//! reconnects with the same backoff policy and keeps going until it succeeds
//! or the manager is disposed. Signals carry the generation of the connection
//! that raised them, so a late signal from an already-replaced connection is
//! ignored.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broker::{BrokerChannel, BrokerConnection, BrokerError, Connector, SignalEvent, SignalSender};
use super::error::EventBusError;
use crate::retry::{self, RetryError, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal.
    Disposed,
}

#[derive(Clone)]
struct ActiveConnection {
    generation: u64,
    connection: Arc<dyn BrokerConnection>,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    active: RwLock<Option<ActiveConnection>>,
    state: Mutex<ConnectionState>,
    connect_lock: tokio::sync::Mutex<()>,
    generations: AtomicU64,
    disposed: AtomicBool,
    signals: mpsc::UnboundedSender<SignalEvent>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("generation", &self.current_generation())
            .field("policy", &self.policy)
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager and start its signal watcher.
    ///
    /// Must be called from within a tokio runtime. Nothing is connected until
    /// [`try_connect`](Self::try_connect) (or the bus) asks for it.
    pub fn new(connector: Arc<dyn Connector>, policy: RetryPolicy) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            connector,
            policy,
            active: RwLock::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
            connect_lock: tokio::sync::Mutex::new(()),
            generations: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            signals: tx,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(watch_signals(
            Arc::downgrade(&manager),
            manager.shutdown.clone(),
            rx,
        ));

        manager
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A connection exists, is open, and the manager is not disposed.
    pub fn is_connected(&self) -> bool {
        !self.is_disposed() && self.current_connection().is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Connect if not already connected.
    ///
    /// Transient failures are retried with the configured backoff; returns
    /// `false` once the budget is exhausted, on a non-retryable failure, or
    /// after disposal. Never returns an error.
    pub async fn try_connect(&self) -> bool {
        self.connect(None).await
    }

    /// Open a channel on the current connection.
    pub async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, EventBusError> {
        let connection = self.current_connection().ok_or(EventBusError::NotConnected)?;
        if self.is_disposed() {
            return Err(EventBusError::NotConnected);
        }
        Ok(connection.create_channel().await?)
    }

    /// Close the connection and stop reconnecting. Idempotent and terminal.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.cancel();
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = ConnectionState::Disposed;

        let active = self
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(active) = active {
            if let Err(err) = active.connection.close().await {
                error!(error = %err, "failed to close broker connection");
            }
        }
        info!("broker connection disposed");
    }

    fn current(&self) -> Option<ActiveConnection> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn current_connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.current()
            .map(|active| active.connection)
            .filter(|connection| connection.is_open())
    }

    fn current_generation(&self) -> Option<u64> {
        self.current().map(|active| active.generation)
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != ConnectionState::Disposed {
            *state = next;
        }
    }

    /// Establish a connection under the connect lock.
    ///
    /// With `replacing = Some(generation)` the current connection is replaced
    /// even if it still looks open, unless someone already replaced it.
    async fn connect(&self, replacing: Option<u64>) -> bool {
        let _guard = self.connect_lock.lock().await;
        if self.is_disposed() {
            return false;
        }

        let already_replaced = match replacing {
            None => true,
            Some(generation) => self.current_generation() != Some(generation),
        };
        if already_replaced && self.is_connected() {
            return true;
        }

        info!("event bus client is trying to connect");
        self.set_state(ConnectionState::Connecting);
        let _connecting = ConnectingGuard { manager: self };

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let signals = SignalSender::new(generation, self.signals.clone());
        let outcome = retry::run(
            &self.policy,
            "connect to broker",
            &self.shutdown,
            BrokerError::is_transient,
            || self.connector.connect(signals.clone()),
        )
        .await;

        match outcome {
            Ok(connection) if connection.is_open() => {
                if self.is_disposed() {
                    let _ = connection.close().await;
                    return false;
                }

                let endpoint = connection.endpoint();
                let previous = self
                    .active
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .replace(ActiveConnection {
                        generation,
                        connection,
                    });
                self.set_state(ConnectionState::Connected);
                info!(
                    endpoint = %endpoint,
                    generation,
                    "event bus client acquired a persistent connection"
                );

                if let Some(previous) = previous {
                    if let Err(err) = previous.connection.close().await {
                        debug!(error = %err, "closing replaced broker connection failed");
                    }
                }
                true
            }
            Ok(_) => {
                error!("broker connection was closed right after opening");
                self.set_state(ConnectionState::Disconnected);
                false
            }
            Err(RetryError::Cancelled) => {
                debug!("connection attempt cancelled");
                false
            }
            Err(RetryError::Failed { attempts, error }) => {
                error!(
                    attempts,
                    error = %error,
                    "event bus connection could not be created and opened"
                );
                self.set_state(ConnectionState::Disconnected);
                false
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Leaves `Connecting` for the state the manager is actually in when a
/// connect attempt ends without deciding it (cancelled or dropped midway).
struct ConnectingGuard<'a> {
    manager: &'a ConnectionManager,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        let connected = self.manager.current_connection().is_some();
        let mut state = self
            .manager
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *state == ConnectionState::Connecting {
            *state = if connected {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            };
        }
    }
}

async fn watch_signals(
    manager: Weak<ConnectionManager>,
    shutdown: CancellationToken,
    mut signals: mpsc::UnboundedReceiver<SignalEvent>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = signals.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        if !reconnect(&manager, &shutdown, event).await {
            break;
        }
    }

    debug!("connection signal watcher stopped");
}

/// Replace the connection that raised `event`, in rounds, until it works.
///
/// The manager is only upgraded for the duration of one round. Returns
/// `false` once the manager is gone or shut down.
async fn reconnect(
    manager: &Weak<ConnectionManager>,
    shutdown: &CancellationToken,
    event: SignalEvent,
) -> bool {
    {
        let Some(current) = manager.upgrade() else {
            return false;
        };
        if current.is_disposed() {
            return false;
        }
        if current.current_generation() != Some(event.generation) {
            debug!(
                generation = event.generation,
                signal = %event.signal,
                "ignoring signal from a replaced connection"
            );
            return true;
        }
    }

    warn!(signal = %event.signal, "broker connection interrupted, trying to reconnect");

    let mut rounds = 0u32;
    loop {
        let pause = {
            let Some(current) = manager.upgrade() else {
                return false;
            };
            if current.is_disposed() {
                return false;
            }
            if current.connect(Some(event.generation)).await {
                return true;
            }
            current.policy.delay_for_attempt(current.policy.max_attempts)
        };

        rounds += 1;
        warn!(
            rounds,
            "broker still unreachable, next reconnection round in {:.1}s",
            pause.as_secs_f64()
        );
        tokio::select! {
            _ = shutdown.cancelled() => return false,
            _ = tokio::time::sleep(pause) => {}
        }
    }
}
