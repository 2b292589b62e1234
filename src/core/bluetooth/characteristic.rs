//! A resolved characteristic and the single-byte boolean codec carried over it.

use std::fmt;

use crate::core::bluetooth::constants::{STATE_OFF, STATE_ON};
use crate::core::bluetooth::error::{BridgeError, TransportError};
use crate::core::bluetooth::transport::{CharacteristicHandle, NotificationStream};

/// Decodes byte 0 of a payload: `1` is on, anything else is off.
/// An empty payload has no state and yields `None`.
pub fn decode_state(payload: &[u8]) -> Option<bool> {
    payload.first().map(|byte| *byte == STATE_ON)
}

/// Log label of a switch state
pub fn on_off(value: bool) -> &'static str {
    if value { "ON" } else { "OFF" }
}

/// Encodes a boolean state as a single byte
pub fn encode_state(value: bool) -> [u8; 1] {
    if value { [STATE_ON] } else { [STATE_OFF] }
}

/// A characteristic bound to a session for one connection epoch
#[derive(Clone)]
pub struct CharacteristicBinding {
    characteristic: CharacteristicHandle,
    epoch: u64,
}

impl CharacteristicBinding {
    pub fn new(characteristic: CharacteristicHandle, epoch: u64) -> Self {
        Self { characteristic, epoch }
    }

    pub fn uuid(&self) -> String {
        self.characteristic.uuid()
    }

    /// Connection epoch this binding belongs to
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Reads the characteristic and decodes its state
    pub async fn read_state(&self) -> Result<bool, BridgeError> {
        let payload = self.characteristic.read().await?;
        decode_state(&payload).ok_or(BridgeError::InvalidPayload)
    }

    /// Writes the state as a single byte
    pub async fn write_state(&self, value: bool) -> Result<(), TransportError> {
        self.characteristic.write(&encode_state(value)).await
    }

    pub async fn subscribe(&self) -> Result<NotificationStream, TransportError> {
        self.characteristic.subscribe().await
    }

    pub async fn unsubscribe(&self) -> Result<(), TransportError> {
        self.characteristic.unsubscribe().await
    }
}

impl fmt::Debug for CharacteristicBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CharacteristicBinding")
            .field("uuid", &self.characteristic.uuid())
            .field("epoch", &self.epoch)
            .finish()
    }
}
