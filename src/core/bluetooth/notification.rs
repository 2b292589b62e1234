//! State update delivery for a bound characteristic
//! This module turns either characteristic notifications (push) or periodic
//! reads (poll) into `on_state_changed` events for the accessory host.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::characteristic::{CharacteristicBinding, decode_state, on_off};
use crate::core::bluetooth::error::UpdateError;
use crate::core::bluetooth::transport::NotificationStream;
use crate::core::bluetooth::types::UpdateMode;

/// Receiver of asynchronous state changes, implemented by the accessory host
pub trait StateListener: Send + Sync {
    fn on_state_changed(&self, value: bool);
}

struct ActiveUpdates {
    mode: UpdateMode,
    cancel: CancellationToken,
    /// Fired by the push task when the notification stream ends on its own
    ended: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the single active update path (subscription or poll timer) of a session
pub struct UpdateSource {
    label: String,
    active: Option<ActiveUpdates>,
}

impl UpdateSource {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            active: None,
        }
    }

    /// Starts delivering updates from `binding`.
    /// Any previously active path is stopped first, so at most one is ever running.
    pub async fn start(
        &mut self,
        binding: &CharacteristicBinding,
        mode: UpdateMode,
        listener: Arc<dyn StateListener>,
    ) -> Result<(), UpdateError> {
        self.stop();

        let cancel = CancellationToken::new();
        let ended = CancellationToken::new();
        let label = self.label.clone();
        let task = match mode {
            UpdateMode::Push => {
                info!("[{}] (by:BLE) -> subscribing to notifications...", self.label);
                let stream = binding.subscribe().await.map_err(|e| {
                    error!(
                        "[{}] (by:BLE) -> error while subscribing to characteristic {}: {}",
                        self.label,
                        binding.uuid(),
                        e
                    );
                    UpdateError::Subscribe(e)
                })?;
                tokio::spawn(Self::process_notifications(
                    label,
                    stream,
                    listener,
                    cancel.clone(),
                    ended.clone(),
                ))
            }
            UpdateMode::Poll(interval) => {
                info!(
                    "[{}] (by:BLE) -> polling characteristic every {} ms",
                    self.label,
                    interval.as_millis()
                );
                tokio::spawn(Self::poll(
                    label,
                    binding.clone(),
                    interval,
                    listener,
                    cancel.clone(),
                ))
            }
        };

        self.active = Some(ActiveUpdates {
            mode,
            cancel,
            ended,
            task,
        });
        Ok(())
    }

    /// Releases the active subscription or poll timer. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            active.task.abort();
            debug!("[{}] (by:BLE) -> stopped {} updates", self.label, active.mode);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Resolves to true if the notification stream ends while the path is active.
    /// Resolves to false once the path is stopped, or right away if none is active.
    pub fn finished(&self) -> impl Future<Output = bool> + Send + 'static {
        let tokens = self
            .active
            .as_ref()
            .map(|active| (active.cancel.clone(), active.ended.clone()));
        async move {
            let Some((cancel, ended)) = tokens else {
                return false;
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = ended.cancelled() => true,
            }
        }
    }

    /// Mode of the running update path, if any
    pub fn mode(&self) -> Option<UpdateMode> {
        self.active.as_ref().map(|active| active.mode)
    }

    /// Process notifications from the characteristic
    async fn process_notifications(
        label: String,
        mut stream: NotificationStream,
        listener: Arc<dyn StateListener>,
        cancel: CancellationToken,
        ended: CancellationToken,
    ) {
        debug!("[{}] (by:BLE) -> listening for notifications...", label);

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(value)) => match decode_state(&value) {
                    Some(state) => {
                        info!("[{}] (by:BLE) -> {}", label, on_off(state));
                        listener.on_state_changed(state);
                    }
                    None => warn!("[{}] (by:BLE) -> ignoring empty notification", label),
                },
                Some(Err(e)) => {
                    error!("[{}] (by:BLE) -> error in notification stream: {}", label, e);
                }
                None => {
                    warn!("[{}] (by:BLE) -> notification stream ended", label);
                    ended.cancel();
                    break;
                }
            }
        }
    }

    /// Read the characteristic on every tick, emitting each value as-is
    async fn poll(
        label: String,
        binding: CharacteristicBinding,
        period: Duration,
        listener: Arc<dyn StateListener>,
        cancel: CancellationToken,
    ) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match binding.read_state().await {
                Ok(state) => {
                    debug!("[{}] (by:BLE) -> polled {}", label, on_off(state));
                    listener.on_state_changed(state);
                }
                Err(e) => warn!("[{}] (by:BLE) -> poll read failed: {}", label, e),
            }
        }
    }
}

impl Drop for UpdateSource {
    fn drop(&mut self) {
        self.stop();
    }
}
