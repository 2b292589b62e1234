//! Application state management
//! This module defines and manages the state shared by the console host.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};

use crate::config::BridgeConfig;
use crate::core::{BluetoothManager, LoggingListener, SwitchAccessory};

/// Global application state
pub struct AppState {
    /// The Bluetooth manager instance
    pub bluetooth_manager: BluetoothManager,
    /// State listeners by accessory name
    listeners: HashMap<String, Arc<LoggingListener>>,
}

impl AppState {
    /// Opens the adapter and registers every configured accessory
    pub async fn new(config: &BridgeConfig) -> Result<Self> {
        info!("Initializing BluetoothManager...");
        let manager = BluetoothManager::new(config.session_config()).await?;
        Ok(Self::with_manager(manager, config))
    }

    pub fn with_manager(mut bluetooth_manager: BluetoothManager, config: &BridgeConfig) -> Self {
        let mut listeners = HashMap::new();
        for accessory in &config.accessories {
            let listener = Arc::new(LoggingListener::new(accessory.name.clone()));
            bluetooth_manager.add_accessory(accessory, listener.clone());
            listeners.insert(accessory.name.to_lowercase(), listener);
        }
        if listeners.is_empty() {
            warn!("No accessories configured.");
        }

        Self {
            bluetooth_manager,
            listeners,
        }
    }

    pub fn accessory(&self, name: &str) -> Option<&SwitchAccessory> {
        self.bluetooth_manager.accessory(name)
    }

    /// Last state pushed by the accessory's peripheral
    pub fn last_value(&self, name: &str) -> Option<bool> {
        self.listeners
            .get(&name.to_lowercase())
            .and_then(|listener| listener.last_value())
    }
}
