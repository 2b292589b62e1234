//! Bluetooth manager for the switch bridge
//! This module provides the main interface for bluetooth operations: one
//! session per configured accessory, all locating through a shared scanner.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use bluest::Adapter;
use futures_util::future::join_all;
use log::info;

use crate::config::AccessoryConfig;
use crate::core::accessory::SwitchAccessory;
use crate::core::bluetooth::bluest_transport::BluestDiscovery;
use crate::core::bluetooth::connection::{PeripheralSession, SessionConfig};
use crate::core::bluetooth::notification::StateListener;
use crate::core::bluetooth::scanner::ScanCoordinator;
use crate::core::bluetooth::transport::Discovery;

/// Manages Bluetooth operations
pub struct BluetoothManager {
    /// Shared scanner every session locates its peripheral through
    scanner: Arc<ScanCoordinator>,
    /// Timings applied to every session
    session_config: SessionConfig,
    /// Registered accessories, in configuration order
    accessories: Vec<SwitchAccessory>,
}

impl BluetoothManager {
    /// Opens the default adapter and waits until it is powered on
    pub async fn new(session_config: SessionConfig) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available.");

        Ok(Self::with_discovery(
            Arc::new(BluestDiscovery::new(adapter)),
            session_config,
        ))
    }

    pub fn with_discovery(discovery: Arc<dyn Discovery>, session_config: SessionConfig) -> Self {
        Self {
            scanner: Arc::new(ScanCoordinator::new(discovery)),
            session_config,
            accessories: Vec::new(),
        }
    }

    /// Creates the session for one configured accessory. It stays idle until [`BluetoothManager::start`].
    pub fn add_accessory(
        &mut self,
        config: &AccessoryConfig,
        listener: Arc<dyn StateListener>,
    ) -> &SwitchAccessory {
        let target = config.target();
        let mode = config.update_mode();
        info!("[{}] registered as {} in {} mode", config.name, target, mode);

        let session = PeripheralSession::spawn(
            target,
            mode,
            self.scanner.clone(),
            listener,
            self.session_config.clone(),
        );
        self.accessories
            .push(SwitchAccessory::new(config.name.clone(), session));
        &self.accessories[self.accessories.len() - 1]
    }

    pub fn accessories(&self) -> &[SwitchAccessory] {
        &self.accessories
    }

    pub fn accessory(&self, name: &str) -> Option<&SwitchAccessory> {
        self.accessories
            .iter()
            .find(|accessory| accessory.name().eq_ignore_ascii_case(name))
    }

    pub fn scanner(&self) -> &ScanCoordinator {
        &self.scanner
    }

    /// Asks every session to connect; failures are retried by the sessions themselves
    pub fn start(&self) {
        info!("Connecting {} accessories...", self.accessories.len());
        for accessory in &self.accessories {
            accessory.session().request_connect();
        }
    }

    /// Shuts every session down, then stops scanning
    pub async fn shutdown(&self) {
        info!("Shutting down {} accessories...", self.accessories.len());
        join_all(
            self.accessories
                .iter()
                .map(|accessory| accessory.session().shutdown()),
        )
        .await;
        self.scanner.shutdown();
        info!("All accessories disconnected.");
    }
}
