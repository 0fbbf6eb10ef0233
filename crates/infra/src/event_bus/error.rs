use eshop_events::{CodecError, RegistryError};

use super::broker::BrokerError;

/// Errors surfaced by the broker-backed event bus.
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("No broker connection is available")]
    NotConnected,

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Event bus has been disposed")]
    Disposed,
}

impl EventBusError {
    /// The broker could not be reached (as opposed to rejecting the request).
    pub fn is_connectivity(&self) -> bool {
        match self {
            Self::NotConnected => true,
            Self::Broker(err) => err.is_transient(),
            _ => false,
        }
    }
}
