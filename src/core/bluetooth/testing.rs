//! In-memory transport used by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Semaphore, mpsc};

use crate::core::bluetooth::error::{ConnectError, TransportError};
use crate::core::bluetooth::notification::StateListener;
use crate::core::bluetooth::transport::{
    AdvertisementStream, Characteristic, CharacteristicHandle, DisconnectStream, Discovery,
    NotificationStream, Peripheral, PeripheralHandle, PeripheralLocator, receiver_stream,
};
use crate::core::bluetooth::types::{Advertisement, DeviceTarget};

type NotificationSender = mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>;

/// Characteristic that stores the last written value and echoes it on read
pub struct FakeCharacteristic {
    uuid: String,
    value: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    writes: Mutex<Vec<Vec<u8>>>,
    subscribers: Mutex<Vec<NotificationSender>>,
    unsubscribes: AtomicUsize,
    read_error: Mutex<Option<TransportError>>,
    write_error: Mutex<Option<TransportError>>,
    subscribe_error: Mutex<Option<TransportError>>,
}

impl FakeCharacteristic {
    pub fn new(uuid: &str) -> Arc<Self> {
        Arc::new(Self {
            uuid: uuid.to_string(),
            value: Mutex::new(vec![0x00]),
            reads: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            unsubscribes: AtomicUsize::new(0),
            read_error: Mutex::new(None),
            write_error: Mutex::new(None),
            subscribe_error: Mutex::new(None),
        })
    }

    pub fn handle(self: &Arc<Self>) -> CharacteristicHandle {
        self.clone()
    }

    pub fn set_value(&self, value: Vec<u8>) {
        *self.value.lock().unwrap() = value;
    }

    pub fn fail_reads(&self, error: Option<TransportError>) {
        *self.read_error.lock().unwrap() = error;
    }

    pub fn fail_writes(&self, error: Option<TransportError>) {
        *self.write_error.lock().unwrap() = error;
    }

    pub fn fail_subscribe(&self, error: Option<TransportError>) {
        *self.subscribe_error.lock().unwrap() = error;
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn unsubscribes(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    /// Number of subscription streams still held by someone
    pub fn live_subscribers(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    /// Closes every notification stream, as a peripheral that stops notifying would
    pub fn end_notifications(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    /// Delivers a notification to every live subscriber
    pub fn notify(&self, payload: &[u8]) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(Ok(payload.to_vec())).is_ok());
        subscribers.len()
    }
}

#[async_trait::async_trait]
impl Characteristic for FakeCharacteristic {
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    async fn read(&self) -> Result<Vec<u8>, TransportError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.read_error.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(self.value.lock().unwrap().clone())
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if let Some(error) = self.write_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.writes.lock().unwrap().push(data.to_vec());
        *self.value.lock().unwrap() = data.to_vec();
        Ok(())
    }

    async fn subscribe(&self) -> Result<NotificationStream, TransportError> {
        if let Some(error) = self.subscribe_error.lock().unwrap().clone() {
            return Err(error);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        Ok(receiver_stream(rx))
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().unwrap().clear();
        Ok(())
    }
}

/// Peripheral with scripted connect outcomes
pub struct FakePeripheral {
    id: String,
    characteristics: Mutex<Vec<CharacteristicHandle>>,
    connected: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    failing_connects: AtomicUsize,
    connect_gate: Mutex<Option<Arc<Semaphore>>>,
    discover_error: Mutex<Option<TransportError>>,
    disconnect_senders: Mutex<Vec<mpsc::UnboundedSender<()>>>,
}

impl FakePeripheral {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            characteristics: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            failing_connects: AtomicUsize::new(0),
            connect_gate: Mutex::new(None),
            discover_error: Mutex::new(None),
            disconnect_senders: Mutex::new(Vec::new()),
        })
    }

    pub fn with_characteristic(self: Arc<Self>, characteristic: &Arc<FakeCharacteristic>) -> Arc<Self> {
        self.characteristics.lock().unwrap().push(characteristic.handle());
        self
    }

    pub fn handle(self: &Arc<Self>) -> PeripheralHandle {
        self.clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// The next `count` connect calls fail
    pub fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Connect calls block until [`FakePeripheral::release_connect`]
    pub fn hold_connects(&self) {
        *self.connect_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_connect(&self) {
        if let Some(gate) = self.connect_gate.lock().unwrap().as_ref() {
            gate.add_permits(1);
        }
    }

    pub fn fail_discovery(&self, error: Option<TransportError>) {
        *self.discover_error.lock().unwrap() = error;
    }

    /// Simulates the peripheral dropping the link
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut senders = self.disconnect_senders.lock().unwrap();
        senders.retain(|tx| tx.send(()).is_ok());
    }
}

#[async_trait::async_trait]
impl Peripheral for FakePeripheral {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let gate = self.connect_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(TransportError::Other("connection refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnections(&self) -> Result<DisconnectStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.disconnect_senders.lock().unwrap().push(tx);
        Ok(receiver_stream(rx))
    }

    async fn discover_characteristics(&self) -> Result<Vec<CharacteristicHandle>, TransportError> {
        if let Some(error) = self.discover_error.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(self.characteristics.lock().unwrap().clone())
    }
}

/// Locator that always hands out the same fake peripheral
pub struct FakeLocator {
    peripheral: Arc<FakePeripheral>,
    locates: AtomicUsize,
}

impl FakeLocator {
    pub fn new(peripheral: &Arc<FakePeripheral>) -> Arc<Self> {
        Arc::new(Self {
            peripheral: peripheral.clone(),
            locates: AtomicUsize::new(0),
        })
    }

    pub fn locates(&self) -> usize {
        self.locates.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PeripheralLocator for FakeLocator {
    async fn locate(&self, _target: &DeviceTarget) -> Result<PeripheralHandle, ConnectError> {
        self.locates.fetch_add(1, Ordering::SeqCst);
        Ok(self.peripheral.handle())
    }
}

/// Discovery driven by the test through [`FakeDiscovery::advertise`]
pub struct FakeDiscovery {
    scans: AtomicUsize,
    senders: Mutex<Vec<mpsc::UnboundedSender<Advertisement>>>,
    connected: Mutex<Vec<Advertisement>>,
}

impl FakeDiscovery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scans: AtomicUsize::new(0),
            senders: Mutex::new(Vec::new()),
            connected: Mutex::new(Vec::new()),
        })
    }

    /// Peripherals reported as already connected to the adapter
    pub fn set_connected(&self, connected: Vec<Advertisement>) {
        *self.connected.lock().unwrap() = connected;
    }

    /// Number of scans ever started
    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    /// Number of scans whose stream is still being consumed
    pub fn active_scans(&self) -> usize {
        let mut senders = self.senders.lock().unwrap();
        senders.retain(|tx| !tx.is_closed());
        senders.len()
    }

    pub fn advertise(&self, advertisement: Advertisement) {
        let mut senders = self.senders.lock().unwrap();
        senders.retain(|tx| tx.send(advertisement.clone()).is_ok());
    }
}

#[async_trait::async_trait]
impl Discovery for FakeDiscovery {
    async fn start_scan(&self) -> Result<AdvertisementStream, TransportError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().push(tx);
        Ok(receiver_stream(rx))
    }

    async fn connected_peripherals(&self) -> Result<Vec<Advertisement>, TransportError> {
        Ok(self.connected.lock().unwrap().clone())
    }
}

/// Listener that records every emitted state
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<bool>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<bool> {
        self.events.lock().unwrap().clone()
    }
}

impl StateListener for RecordingListener {
    fn on_state_changed(&self, value: bool) {
        self.events.lock().unwrap().push(value);
    }
}
