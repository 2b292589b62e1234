//! Error types for the connection lifecycle.
//! Expected failures (disconnects, missing characteristics) are values, never panics.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by the BLE transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peripheral is not connected")]
    Disconnected,
    #[error("operation timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// True when the failure means the link to the peripheral is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

impl From<bluest::Error> for TransportError {
    fn from(err: bluest::Error) -> Self {
        match err.kind() {
            bluest::error::ErrorKind::NotConnected => Self::Disconnected,
            bluest::error::ErrorKind::Timeout => Self::Timeout,
            _ => Self::Other(err.to_string()),
        }
    }
}

/// Failure of a connect attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("scan failed: {0}")]
    Scan(TransportError),
    #[error("peripheral {0} is not connectable")]
    NotConnectable(String),
    #[error("connect failed: {0}")]
    Transport(#[from] TransportError),
    #[error("connect attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("session is shutting down")]
    ShuttingDown,
    #[error("connect attempt was abandoned")]
    Abandoned,
}

/// Failure to bind the configured characteristic
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no characteristics found")]
    NoCharacteristicsFound,
    #[error("characteristic #{0} not found")]
    NotFound(String),
    #[error("discovery failed: {0}")]
    DiscoveryFailed(TransportError),
}

/// Failure to start state updates
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    #[error("could not subscribe to characteristic: {0}")]
    Subscribe(TransportError),
}

/// Failure surfaced to the accessory host
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("peripheral not ready")]
    NotReady,
    #[error("transport failure: {0}")]
    TransportFailure(#[from] TransportError),
    #[error("characteristic returned an empty payload")]
    InvalidPayload,
}
