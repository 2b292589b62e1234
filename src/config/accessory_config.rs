use anyhow::{Result, bail};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::core::bluetooth::{DeviceTarget, MIN_POLL_INTERVAL_MS, UpdateMode};

/// Kind of accessory exposed to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessoryKind {
    #[default]
    Switch,
}

/// One configured BLE switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessoryConfig {
    /// Display name, also used to prefix log lines
    pub name: String,

    #[serde(rename = "type", default)]
    pub kind: AccessoryKind,

    /// Peripheral id or MAC address
    #[serde(alias = "deviceId")]
    pub device_id: String,

    #[serde(alias = "serviceId")]
    pub service_id: String,

    #[serde(alias = "characteristicId")]
    pub characteristic_id: String,

    /// Poll interval; absent or below one second means push notifications
    #[serde(
        default,
        alias = "intervalForUpdating",
        skip_serializing_if = "Option::is_none"
    )]
    pub update_interval_ms: Option<u64>,
}

impl AccessoryConfig {
    /// Checks the required fields. A too-small poll interval is only warned about.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("name", &self.name),
            ("device_id", &self.device_id),
            ("service_id", &self.service_id),
            ("characteristic_id", &self.characteristic_id),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                bail!("accessory {:?}: {} must not be empty", self.name, field);
            }
        }

        if let Some(interval) = self.update_interval_ms {
            if interval < MIN_POLL_INTERVAL_MS {
                warn!(
                    "[{}] update_interval_ms {} is below {} ms, using notifications instead of polling",
                    self.name, interval, MIN_POLL_INTERVAL_MS
                );
            }
        }
        Ok(())
    }

    pub fn target(&self) -> DeviceTarget {
        DeviceTarget::new(
            self.name.clone(),
            self.device_id.clone(),
            &self.service_id,
            &self.characteristic_id,
        )
    }

    pub fn update_mode(&self) -> UpdateMode {
        UpdateMode::from_interval(self.update_interval_ms)
    }
}
