//! Characteristic discovery for a connected peripheral

use log::{debug, info, warn};

use crate::core::bluetooth::characteristic::CharacteristicBinding;
use crate::core::bluetooth::error::ResolveError;
use crate::core::bluetooth::transport::Peripheral;
use crate::core::bluetooth::types::{DeviceTarget, normalize_id};

/// Resolves the configured characteristic on a connected peripheral
pub struct CharacteristicResolver;

impl CharacteristicResolver {
    /// Discovers all characteristics and binds the first one matching the target.
    /// Failures are returned as-is; retrying is the supervisor's job.
    pub async fn resolve(
        peripheral: &dyn Peripheral,
        target: &DeviceTarget,
        epoch: u64,
    ) -> Result<CharacteristicBinding, ResolveError> {
        debug!("[{}] (by:BLE) -> discovering services ...", target.name());

        let characteristics = peripheral
            .discover_characteristics()
            .await
            .map_err(ResolveError::DiscoveryFailed)?;

        if characteristics.is_empty() {
            warn!("[{}] (by:BLE) -> no characteristics found!", target.name());
            return Err(ResolveError::NoCharacteristicsFound);
        }

        let wanted = target.characteristic_id();
        let Some(characteristic) = characteristics
            .into_iter()
            .find(|c| normalize_id(&c.uuid()) == wanted)
        else {
            warn!(
                "[{}] (by:BLE) -> registered characteristic NOT found. Your config says id: #{}",
                target.name(),
                wanted
            );
            return Err(ResolveError::NotFound(wanted.to_string()));
        };

        info!(
            "[{}] (by:BLE) -> characteristic found: #{}",
            target.name(),
            characteristic.uuid()
        );

        let binding = CharacteristicBinding::new(characteristic, epoch);
        // Listeners left over from an earlier epoch must not survive into this one.
        if let Err(e) = binding.unsubscribe().await {
            debug!(
                "[{}] (by:BLE) -> clearing previous subscription failed: {}",
                target.name(),
                e
            );
        }

        Ok(binding)
    }
}
