//! Bluetooth functionality for the switch bridge
//! This module handles all bluetooth operations including scanning,
//! connecting, resolving the switch characteristic and receiving its state.

mod bluest_transport;
mod characteristic;
mod connection;
mod constants;
mod error;
mod manager;
mod notification;
mod resolver;
mod scanner;
mod transport;
mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export types that should be publicly accessible
pub use bluest_transport::{BluestCharacteristic, BluestDiscovery, BluestPeripheral};
pub use characteristic::{CharacteristicBinding, decode_state, encode_state, on_off};
pub use connection::{PeripheralSession, SessionConfig, SessionHandle, SessionView};
pub use constants::*; // Re-export all constants
pub use error::{BridgeError, ConnectError, ResolveError, TransportError, UpdateError};
pub use manager::BluetoothManager;
pub use notification::{StateListener, UpdateSource};
pub use resolver::CharacteristicResolver;
pub use scanner::ScanCoordinator;
pub use transport::{
    AdvertisementStream, Characteristic, CharacteristicHandle, DisconnectStream, Discovery,
    NotificationStream, Peripheral, PeripheralHandle, PeripheralLocator, receiver_stream,
};
pub use types::{
    Advertisement, ConnectionState, DeviceTarget, UpdateMode, normalize_address, normalize_id,
};
