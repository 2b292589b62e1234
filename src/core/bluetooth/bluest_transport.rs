//! Transport implementation on top of bluest
//! bluest streams borrow the adapter, device or characteristic they come from,
//! so every stream is driven by a task that owns a clone and forwards items
//! through a channel until the consumer drops its end.

use std::sync::Arc;

use bluest::{Adapter, AdvertisingDevice, ConnectionEvent, Device};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, info};
use regex::Regex;
use tokio::sync::{mpsc, oneshot};

use crate::core::bluetooth::error::TransportError;
use crate::core::bluetooth::transport::{
    AdvertisementStream, Characteristic, CharacteristicHandle, DisconnectStream, Discovery,
    NotificationStream, Peripheral, receiver_stream,
};
use crate::core::bluetooth::types::Advertisement;

type Ready = oneshot::Sender<Result<(), TransportError>>;

/// Waits for a forwarding task to report that its source stream is open
async fn forwarded<T: Send + 'static>(
    ready: oneshot::Receiver<Result<(), TransportError>>,
    rx: mpsc::UnboundedReceiver<T>,
) -> Result<BoxStream<'static, T>, TransportError> {
    match ready.await {
        Ok(Ok(())) => Ok(receiver_stream(rx)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(TransportError::Other(
            "stream task ended before it started".to_string(),
        )),
    }
}

fn signal<T>(ready: Ready, result: Result<T, bluest::Error>) -> Option<T> {
    match result {
        Ok(value) => {
            let _ = ready.send(Ok(()));
            Some(value)
        }
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            None
        }
    }
}

/// Extracts a MAC address from a platform device id
/// (`hci0/dev_AA_BB_CC_DD_EE_FF`, `BluetoothLE#BluetoothLE00:11:..-aa:bb:..`)
fn extract_mac_address(device_id: &str) -> Option<String> {
    let re = Regex::new(r"([0-9A-Fa-f]{2}[:_-]){5}[0-9A-Fa-f]{2}").ok()?;
    re.find_iter(device_id)
        .last()
        .map(|m| m.as_str().replace(['_', '-'], ":").to_uppercase())
}

/// A bluest device together with the adapter that connects it
pub struct BluestPeripheral {
    adapter: Adapter,
    device: Device,
}

impl BluestPeripheral {
    pub fn new(adapter: Adapter, device: Device) -> Self {
        Self { adapter, device }
    }
}

#[async_trait::async_trait]
impl Peripheral for BluestPeripheral {
    fn id(&self) -> String {
        self.device.id().to_string()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.adapter.connect_device(&self.device).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if self.device.is_connected().await {
            info!("Disconnecting from device {}", self.device.id());
            self.adapter.disconnect_device(&self.device).await?;
        } else {
            debug!("Device {} not connected", self.device.id());
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.device.is_connected().await
    }

    async fn disconnections(&self) -> Result<DisconnectStream, TransportError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = self.adapter.clone();
        let device = self.device.clone();

        tokio::spawn(async move {
            let Some(events) = signal(ready_tx, adapter.device_connection_events(&device).await)
            else {
                return;
            };
            futures_util::pin_mut!(events);

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = events.next() => match event {
                        Some(ConnectionEvent::Disconnected) => {
                            if tx.send(()).is_err() {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        });

        forwarded(ready_rx, rx).await
    }

    async fn discover_characteristics(&self) -> Result<Vec<CharacteristicHandle>, TransportError> {
        let mut characteristics: Vec<CharacteristicHandle> = Vec::new();
        for service in self.device.discover_services().await? {
            debug!("Available service: {}", service.uuid());
            for characteristic in service.discover_characteristics().await? {
                characteristics.push(Arc::new(BluestCharacteristic::new(characteristic)));
            }
        }
        Ok(characteristics)
    }
}

/// A bluest characteristic
pub struct BluestCharacteristic {
    inner: bluest::Characteristic,
}

impl BluestCharacteristic {
    pub fn new(inner: bluest::Characteristic) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl Characteristic for BluestCharacteristic {
    fn uuid(&self) -> String {
        self.inner.uuid().to_string()
    }

    async fn read(&self) -> Result<Vec<u8>, TransportError> {
        Ok(self.inner.read().await?)
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        self.inner.write(data).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<NotificationStream, TransportError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let characteristic = self.inner.clone();

        tokio::spawn(async move {
            let Some(notifications) = signal(ready_tx, characteristic.notify().await) else {
                return;
            };
            futures_util::pin_mut!(notifications);

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    item = notifications.next() => match item {
                        Some(item) => {
                            if tx.send(item.map_err(TransportError::from)).is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            debug!("Notification forwarding for {} stopped", characteristic.uuid());
        });

        forwarded(ready_rx, rx).await
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        // bluest ends the subscription once the last notify stream is dropped.
        Ok(())
    }
}

/// Scans with a bluest adapter
pub struct BluestDiscovery {
    adapter: Adapter,
}

impl BluestDiscovery {
    pub fn new(adapter: Adapter) -> Self {
        Self { adapter }
    }

    fn advertisement(adapter: &Adapter, found: AdvertisingDevice) -> Advertisement {
        let AdvertisingDevice {
            device,
            adv_data,
            rssi,
        } = found;
        let id = device.id().to_string();

        Advertisement {
            address: extract_mac_address(&id),
            local_name: adv_data.local_name.or_else(|| device.name().ok()),
            services: adv_data.services.iter().map(|uuid| uuid.to_string()).collect(),
            connectable: adv_data.is_connectable,
            rssi,
            id,
            peripheral: Arc::new(BluestPeripheral::new(adapter.clone(), device)),
        }
    }
}

#[async_trait::async_trait]
impl Discovery for BluestDiscovery {
    async fn start_scan(&self) -> Result<AdvertisementStream, TransportError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = self.adapter.clone();

        tokio::spawn(async move {
            let Some(scan_stream) = signal(ready_tx, adapter.scan(&[]).await) else {
                return;
            };
            futures_util::pin_mut!(scan_stream);
            info!("Starting bluetooth scan");

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    found = scan_stream.next() => match found {
                        Some(found) => {
                            debug!("Found device - Device: {:?}, RSSI: {:?}", found.device, found.rssi);
                            if tx.send(Self::advertisement(&adapter, found)).is_err() {
                                break;
                            }
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
            }
        });

        forwarded(ready_rx, rx).await
    }

    async fn connected_peripherals(&self) -> Result<Vec<Advertisement>, TransportError> {
        let mut connected = Vec::new();
        for device in self.adapter.connected_devices().await? {
            let id = device.id().to_string();
            let services = match device.services().await {
                Ok(services) => services.iter().map(|s| s.uuid().to_string()).collect(),
                Err(_) => Vec::new(),
            };
            connected.push(Advertisement {
                address: extract_mac_address(&id),
                local_name: device.name().ok(),
                services,
                connectable: true,
                rssi: None,
                id,
                peripheral: Arc::new(BluestPeripheral::new(self.adapter.clone(), device)),
            });
        }
        Ok(connected)
    }
}
