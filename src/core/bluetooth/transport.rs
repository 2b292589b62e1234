//! Capability traits over the BLE transport.
//! The session state machine only talks to these traits; `bluest_transport`
//! provides the implementation for real hardware.

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;

use crate::core::bluetooth::error::{ConnectError, TransportError};
use crate::core::bluetooth::types::{Advertisement, DeviceTarget};

/// Shared handle to a physical peripheral
pub type PeripheralHandle = Arc<dyn Peripheral>;

/// Shared handle to one discovered characteristic
pub type CharacteristicHandle = Arc<dyn Characteristic>;

/// Stream of notification payloads from a subscribed characteristic
pub type NotificationStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// Stream that yields once per disconnect of a peripheral
pub type DisconnectStream = BoxStream<'static, ()>;

/// Stream of advertisements produced by an active scan.
/// Dropping the stream stops the scan.
pub type AdvertisementStream = BoxStream<'static, Advertisement>;

/// A physical BLE peripheral
#[async_trait::async_trait]
pub trait Peripheral: Send + Sync {
    /// Platform-specific identifier
    fn id(&self) -> String;

    /// Establish the link
    async fn connect(&self) -> Result<(), TransportError>;

    /// Tear the link down
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Whether the link is currently up
    async fn is_connected(&self) -> bool;

    /// Subscribe to disconnect signals for this peripheral
    async fn disconnections(&self) -> Result<DisconnectStream, TransportError>;

    /// Discover every characteristic of every service, in discovery order
    async fn discover_characteristics(&self) -> Result<Vec<CharacteristicHandle>, TransportError>;
}

/// One GATT characteristic
#[async_trait::async_trait]
pub trait Characteristic: Send + Sync {
    /// Characteristic UUID as reported by the transport
    fn uuid(&self) -> String;

    async fn read(&self) -> Result<Vec<u8>, TransportError>;

    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Subscribe to value-change notifications
    async fn subscribe(&self) -> Result<NotificationStream, TransportError>;

    /// Drop every listener previously attached to this characteristic
    async fn unsubscribe(&self) -> Result<(), TransportError>;
}

/// Source of advertisements, owned by the scan coordinator
#[async_trait::async_trait]
pub trait Discovery: Send + Sync {
    async fn start_scan(&self) -> Result<AdvertisementStream, TransportError>;

    /// Peripherals the adapter is already connected to
    async fn connected_peripherals(&self) -> Result<Vec<Advertisement>, TransportError> {
        Ok(Vec::new())
    }
}

/// Finds the peripheral a session should connect to
#[async_trait::async_trait]
pub trait PeripheralLocator: Send + Sync {
    async fn locate(&self, target: &DeviceTarget) -> Result<PeripheralHandle, ConnectError>;
}

/// Wraps a channel receiver into a `'static` stream.
/// Transports forward borrowed platform streams through a channel with this.
pub fn receiver_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}
