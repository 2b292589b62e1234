use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::error::{ConnectError, TransportError};
use crate::core::bluetooth::transport::{Discovery, PeripheralHandle, PeripheralLocator};
use crate::core::bluetooth::types::{Advertisement, DeviceTarget};

type LocateResult = Result<PeripheralHandle, ConnectError>;

struct Waiter {
    id: u64,
    target: DeviceTarget,
    tx: oneshot::Sender<LocateResult>,
}

struct ScanTask {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct ScanState {
    next_id: u64,
    next_generation: u64,
    waiters: Vec<Waiter>,
    scan: Option<ScanTask>,
}

/// The single owner of adapter scanning.
/// Sessions locate their peripheral through it; the scan runs only while at
/// least one request is waiting.
pub struct ScanCoordinator {
    discovery: Arc<dyn Discovery>,
    state: Arc<Mutex<ScanState>>,
}

/// Claim on the shared scan held by one `locate` call.
/// Dropping it withdraws the request and stops the scan once nobody waits.
struct ScanLease {
    id: u64,
    state: Arc<Mutex<ScanState>>,
}

impl Drop for ScanLease {
    fn drop(&mut self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.waiters.retain(|w| w.id != self.id);
        if state.waiters.is_empty() {
            if let Some(scan) = state.scan.take() {
                debug!("No pending requests, stopping scan.");
                scan.cancel.cancel();
            }
        }
    }
}

impl ScanCoordinator {
    pub fn new(discovery: Arc<dyn Discovery>) -> Self {
        Self {
            discovery,
            state: Arc::new(Mutex::new(ScanState::default())),
        }
    }

    /// Whether a scan is currently running
    pub fn is_scanning(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.scan.is_some())
            .unwrap_or(false)
    }

    /// Number of locate requests waiting for an advertisement
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.waiters.len())
            .unwrap_or(0)
    }

    /// Stops scanning and fails every pending request
    pub fn shutdown(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        info!("Stopping Bluetooth scan.");
        if let Some(scan) = state.scan.take() {
            scan.cancel.cancel();
            scan.handle.abort();
        }
        for waiter in state.waiters.drain(..) {
            let _ = waiter.tx.send(Err(ConnectError::ShuttingDown));
        }
    }

    fn acquire(&self, target: &DeviceTarget) -> (ScanLease, oneshot::Receiver<LocateResult>) {
        let (tx, rx) = oneshot::channel();
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        state.next_id += 1;
        let id = state.next_id;
        state.waiters.push(Waiter {
            id,
            target: target.clone(),
            tx,
        });

        if state.scan.is_none() {
            state.next_generation += 1;
            let generation = state.next_generation;
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(Self::internal_scan_task(
                self.discovery.clone(),
                self.state.clone(),
                cancel.clone(),
                generation,
            ));
            state.scan = Some(ScanTask {
                generation,
                cancel,
                handle,
            });
            info!("Device scan task started.");
        }

        let lease = ScanLease {
            id,
            state: self.state.clone(),
        };
        (lease, rx)
    }

    async fn internal_scan_task(
        discovery: Arc<dyn Discovery>,
        state: Arc<Mutex<ScanState>>,
        cancel: CancellationToken,
        generation: u64,
    ) {
        info!("Starting bluetooth scan");
        let mut scan_stream = match discovery.start_scan().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start scan: {}", e);
                Self::finish(&state, generation, ConnectError::Scan(e));
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = scan_stream.next() => match result {
                    Some(advertisement) => {
                        debug!("[DISCOVERED] ble device: {:?}", advertisement);
                        if Self::dispatch(&state, generation, advertisement) {
                            break;
                        }
                    }
                    None => {
                        info!("Bluetooth scan stream has ended.");
                        let ended = TransportError::Other("scan stream ended".to_string());
                        Self::finish(&state, generation, ConnectError::Scan(ended));
                        break;
                    }
                }
            }
        }

        info!("Scanning stopped.");
    }

    /// Hands an advertisement to the first waiter it belongs to.
    /// Returns true when the scan should stop.
    fn dispatch(state: &Arc<Mutex<ScanState>>, generation: u64, advertisement: Advertisement) -> bool {
        let Ok(mut guard) = state.lock() else {
            return true;
        };

        if let Some(index) = guard
            .waiters
            .iter()
            .position(|w| w.target.matches(&advertisement))
        {
            let waiter = guard.waiters.remove(index);
            let name = advertisement.local_name.as_deref().unwrap_or("Unknown");

            if advertisement.connectable {
                info!(
                    "[FOUND] ble device ([SERVICE-ID: #{}]) {} ({}) for [{}]",
                    waiter.target.service_id(),
                    advertisement.address.as_deref().unwrap_or(&advertisement.id),
                    name,
                    waiter.target.name()
                );
                let _ = waiter.tx.send(Ok(advertisement.peripheral.clone()));
            } else {
                warn!(
                    "[WARNING] Peripheral ([SERVICE-ID: #{}]) {} ({}) is not connectable!",
                    waiter.target.service_id(),
                    advertisement.id,
                    name
                );
                let _ = waiter
                    .tx
                    .send(Err(ConnectError::NotConnectable(advertisement.id.clone())));
            }
        }

        if guard.waiters.is_empty() {
            if guard.scan.as_ref().map(|s| s.generation) == Some(generation) {
                guard.scan = None;
            }
            return true;
        }
        false
    }

    /// Clears this scan from the shared state and fails everyone still waiting on it
    fn finish(state: &Arc<Mutex<ScanState>>, generation: u64, failure: ConnectError) {
        let Ok(mut guard) = state.lock() else {
            return;
        };
        if guard.scan.as_ref().map(|s| s.generation) != Some(generation) {
            return;
        }
        guard.scan = None;
        for waiter in guard.waiters.drain(..) {
            let _ = waiter.tx.send(Err(failure.clone()));
        }
    }
}

#[async_trait::async_trait]
impl PeripheralLocator for ScanCoordinator {
    async fn locate(&self, target: &DeviceTarget) -> Result<PeripheralHandle, ConnectError> {
        // find connected device first
        match self.discovery.connected_peripherals().await {
            Ok(connected) => {
                if let Some(advertisement) = connected.into_iter().find(|a| target.matches(a)) {
                    info!(
                        "[{}] (by:BLE) -> peripheral {} already connected",
                        target.name(),
                        advertisement.id
                    );
                    return Ok(advertisement.peripheral);
                }
            }
            Err(e) => debug!("Could not list connected devices: {}", e),
        }

        let (lease, rx) = self.acquire(target);
        let result = rx.await.unwrap_or(Err(ConnectError::Abandoned));
        drop(lease);
        result
    }
}
