//! Defines shared data structures for the Bluetooth module.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    BLUETOOTH_BASE_MASK, BLUETOOTH_BASE_UUID, MIN_POLL_INTERVAL_MS,
};

/// Normalizes a UUID-like identifier for comparison: hyphens stripped, lowercased.
/// Full UUIDs in the Bluetooth base range collapse to their 16/32-bit alias,
/// so `0000FFE1-0000-1000-8000-00805F9B34FB` and `ffe1` compare equal.
pub fn normalize_id(id: &str) -> String {
    let normalized = id.trim().replace('-', "").to_lowercase();
    if normalized.len() != 32 {
        return normalized;
    }

    match Uuid::try_parse(&normalized) {
        Ok(uuid) if uuid.as_u128() & BLUETOOTH_BASE_MASK == BLUETOOTH_BASE_UUID.as_u128() => {
            let alias = (uuid.as_u128() >> 96) as u32;
            if alias <= 0xffff {
                format!("{:04x}", alias)
            } else {
                format!("{:08x}", alias)
            }
        }
        _ => normalized,
    }
}

/// Normalizes a peripheral identifier or address.
/// Address separators (`:`, `_`, `-`) are dropped so `AA:BB:..` matches `aa_bb_..`.
pub fn normalize_address(id: &str) -> String {
    id.trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '_' | '-'))
        .collect::<String>()
        .to_lowercase()
}

/// Identifies the peripheral and characteristic a session binds to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTarget {
    name: String,
    device_id: String,
    service_id: String,
    characteristic_id: String,
}

impl DeviceTarget {
    /// Creates a new DeviceTarget, normalizing the service and characteristic ids
    pub fn new(
        name: impl Into<String>,
        device_id: impl Into<String>,
        service_id: &str,
        characteristic_id: &str,
    ) -> Self {
        Self {
            name: name.into(),
            device_id: device_id.into().trim().to_string(),
            service_id: normalize_id(service_id),
            characteristic_id: normalize_id(characteristic_id),
        }
    }

    /// Display name used to prefix log lines
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opaque peripheral identifier as configured
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Normalized service id
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Normalized characteristic id
    pub fn characteristic_id(&self) -> &str {
        &self.characteristic_id
    }

    /// Returns true if an advertisement belongs to this target.
    /// The peripheral id or address must match the configured device id. The
    /// advertised service alone is enough only when no device id is configured
    /// or the platform hides the peripheral's address.
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        let device_id = normalize_address(&self.device_id);
        if !device_id.is_empty() {
            if normalize_address(&advertisement.id) == device_id {
                return true;
            }
            match &advertisement.address {
                Some(address) if normalize_address(address) == device_id => return true,
                Some(_) => return false,
                None => {}
            }
        }

        advertisement
            .services
            .iter()
            .any(|service| normalize_id(service) == self.service_id)
    }
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (device {}, service #{}, characteristic #{})",
            self.name, self.device_id, self.service_id, self.characteristic_id
        )
    }
}

/// A peripheral seen while scanning
#[derive(Clone)]
pub struct Advertisement {
    /// Handle used to connect to the advertising peripheral
    pub peripheral: crate::core::bluetooth::transport::PeripheralHandle,
    /// Platform-specific unique identifier
    pub id: String,
    /// MAC address when the platform exposes one
    pub address: Option<String>,
    /// Advertised local name, if any
    pub local_name: Option<String>,
    /// Advertised service ids (normalized)
    pub services: Vec<String>,
    /// Whether the peripheral accepts connections
    pub connectable: bool,
    /// The signal strength (RSSI) of the device
    pub rssi: Option<i16>,
}

impl fmt::Debug for Advertisement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Advertisement")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("local_name", &self.local_name)
            .field("services", &self.services)
            .field("connectable", &self.connectable)
            .field("rssi", &self.rssi)
            .finish()
    }
}

/// Lifecycle state of a peripheral session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Characteristic discovery in progress
    Resolving,
    /// Characteristic bound, updates flowing
    Ready,
}

impl ConnectionState {
    /// True once a link exists, whether or not the characteristic is bound yet
    pub fn is_linked(self) -> bool {
        matches!(self, Self::Connected | Self::Resolving | Self::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Resolving => "resolving",
            Self::Ready => "ready",
        };
        f.write_str(label)
    }
}

/// How state changes reach the accessory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Subscribe to characteristic notifications
    Push,
    /// Read the characteristic on a fixed interval
    Poll(Duration),
}

impl UpdateMode {
    /// Derives the mode from an optional configured interval.
    /// Only an interval of at least [`MIN_POLL_INTERVAL_MS`] selects polling.
    pub fn from_interval(update_interval_ms: Option<u64>) -> Self {
        match update_interval_ms {
            Some(ms) if ms >= MIN_POLL_INTERVAL_MS => Self::Poll(Duration::from_millis(ms)),
            _ => Self::Push,
        }
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push => f.write_str("push"),
            Self::Poll(interval) => write!(f, "poll every {} ms", interval.as_millis()),
        }
    }
}
