//! Constants used throughout the bridge
//! This module contains the timing defaults and protocol values shared by
//! the connection supervisor, the update source and the transport.

use uuid::Uuid;

/// The Bluetooth base UUID (`0000xxxx-0000-1000-8000-00805f9b34fb`).
/// UUIDs inside this range are rendered in their short 16/32-bit form.
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805f9b34fb);

/// Mask selecting everything but the 32-bit alias of a base-range UUID
pub const BLUETOOTH_BASE_MASK: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;

/// Delay before a failed connect attempt is retried, in milliseconds
pub const CONNECT_RETRY_DELAY_MS: u64 = 10_000;

/// Pause after an unsolicited disconnect before reconnecting, in milliseconds
pub const RECONNECT_SETTLE_DELAY_MS: u64 = 3_000;

/// Upper bound for locating and connecting a peripheral, in milliseconds
pub const CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Timeout for reads and writes issued on behalf of the accessory host, in seconds.
/// The host's query path is synchronous so this stays short.
pub const BRIDGE_OPERATION_TIMEOUT_SECS: u64 = 5;

/// Timeout for Bluetooth operations in seconds
pub const BLUETOOTH_OPERATION_TIMEOUT_SECS: u64 = 10;

/// Smallest accepted polling interval in milliseconds
pub const MIN_POLL_INTERVAL_MS: u64 = 1_000;

/// Payload byte that decodes to `true`; every other value decodes to `false`
pub const STATE_ON: u8 = 0x01;

/// Payload byte written for `false`
pub const STATE_OFF: u8 = 0x00;
