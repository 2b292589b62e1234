//! Core functionality for the switch bridge
//! This module contains the BLE connection lifecycle and the accessory surface built on it.

pub mod accessory;
pub mod bluetooth;

// Re-export commonly used types
pub use accessory::{LoggingListener, SwitchAccessory};
pub use bluetooth::BluetoothManager;
