//! Central session backed by btleplug.
//!
//! Scans through the platform adapter, keeps the peripherals it has seen, and
//! maintains GATT links to the peers it is asked to connect to.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{Stream, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::{GattProfile, ProvisionerConfig};
use crate::error::{Error, Result};
use crate::role::Role;
use crate::session::{CentralSession, DiscoveredDevice, InboundData, PeerAddress};

/// Reference-counted radio scan.
#[derive(Default)]
struct ScanState {
    refs: usize,
    handle: Option<JoinHandle<()>>,
}

/// Central session on the platform's default BLE stack.
pub struct BtleplugCentralSession {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    /// GATT layout expected on peers.
    gatt: GattProfile,
    /// Scan reference count and event loop handle.
    scan: Mutex<ScanState>,
    /// Whether a radio scan is active.
    is_scanning: Arc<AtomicBool>,
    /// Peripheral handles by address.
    peripherals: Arc<RwLock<HashMap<PeerAddress, Peripheral>>>,
    /// Discovered devices by address.
    discovered: Arc<RwLock<HashMap<PeerAddress, DiscoveredDevice>>>,
    /// Notification forwarders for connected peers.
    links: Arc<RwLock<HashMap<PeerAddress, JoinHandle<()>>>>,
    /// Channel for discovery events.
    discovery_tx: broadcast::Sender<DiscoveredDevice>,
    /// Channel for notifications from connected peers.
    data_tx: broadcast::Sender<InboundData>,
    /// Set once by `close`.
    closed: AtomicBool,
}

impl BtleplugCentralSession {
    /// Open the adapter selected by `config.adapter_index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HardwareUnavailable`] if Bluetooth is not available
    /// or the adapter does not exist.
    pub async fn new(config: &ProvisionerConfig) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| Error::hardware_unavailable(Role::Central, e))?;

        let adapters = manager
            .adapters()
            .await
            .map_err(|e| Error::hardware_unavailable(Role::Central, e))?;

        let adapter = adapters
            .into_iter()
            .nth(config.adapter_index)
            .ok_or_else(|| {
                Error::hardware_unavailable(
                    Role::Central,
                    format!("no Bluetooth adapter at index {}", config.adapter_index),
                )
            })?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter, config.gatt))
    }

    /// Create a session on a specific adapter.
    pub fn with_adapter(adapter: Adapter, gatt: GattProfile) -> Self {
        let (discovery_tx, _) = broadcast::channel(100);
        let (data_tx, _) = broadcast::channel(256);

        Self {
            adapter,
            gatt,
            scan: Mutex::new(ScanState::default()),
            is_scanning: Arc::new(AtomicBool::new(false)),
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            discovered: Arc::new(RwLock::new(HashMap::new())),
            links: Arc::new(RwLock::new(HashMap::new())),
            discovery_tx,
            data_tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::session_failed(operation, "session closed"));
        }
        Ok(())
    }

    fn peripheral(&self, address: &PeerAddress) -> Result<Peripheral> {
        self.peripherals
            .read()
            .get(address)
            .cloned()
            .ok_or_else(|| Error::PeerNotFound {
                address: address.to_string(),
            })
    }

    /// Handle a BLE central event.
    async fn handle_event(
        event: CentralEvent,
        adapter: &Adapter,
        filter: &[Uuid],
        peripherals: &Arc<RwLock<HashMap<PeerAddress, Peripheral>>>,
        discovered: &Arc<RwLock<HashMap<PeerAddress, DiscoveredDevice>>>,
        links: &Arc<RwLock<HashMap<PeerAddress, JoinHandle<()>>>>,
        discovery_tx: &broadcast::Sender<DiscoveredDevice>,
    ) {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ServicesAdvertisement { id, .. }
            | CentralEvent::ServiceDataAdvertisement { id, .. } => {
                Self::process_peripheral(adapter, id, filter, peripherals, discovered, discovery_tx)
                    .await;
            }
            CentralEvent::DeviceDisconnected(id) => {
                let address = PeerAddress::new(id.to_string());
                if let Some(handle) = links.write().remove(&address) {
                    debug!("Link to {} lost", address);
                    handle.abort();
                }
            }
            _ => {}
        }
    }

    /// Process a discovered peripheral.
    async fn process_peripheral(
        adapter: &Adapter,
        id: PeripheralId,
        filter: &[Uuid],
        peripherals: &Arc<RwLock<HashMap<PeerAddress, Peripheral>>>,
        discovered: &Arc<RwLock<HashMap<PeerAddress, DiscoveredDevice>>>,
        discovery_tx: &broadcast::Sender<DiscoveredDevice>,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        let address = PeerAddress::new(id.to_string());
        let device = DiscoveredDevice {
            address: address.clone(),
            local_name: properties.local_name,
            rssi: properties.rssi,
            services: properties.services,
            service_data: properties.service_data,
            last_seen: Utc::now(),
        };

        if !matches_filter(&device, filter) {
            return;
        }

        trace!("Device discovered: {}", address);

        peripherals.write().insert(address.clone(), peripheral);
        discovered.write().insert(address, device.clone());

        let _ = discovery_tx.send(device);
    }
}

type EventStream = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

/// The adapter calls needed to begin a radio scan.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
trait ScanRadio: Send + Sync {
    async fn events(&self) -> btleplug::Result<EventStream>;
    async fn start_scan(&self, filter: ScanFilter) -> btleplug::Result<()>;
}

#[async_trait]
impl ScanRadio for Adapter {
    async fn events(&self) -> btleplug::Result<EventStream> {
        Central::events(self).await
    }

    async fn start_scan(&self, filter: ScanFilter) -> btleplug::Result<()> {
        Central::start_scan(self, filter).await
    }
}

/// Subscribe to adapter events, then start the radio scan.
async fn open_scan<R: ScanRadio + ?Sized>(radio: &R, services: &[Uuid]) -> Result<EventStream> {
    let events = radio
        .events()
        .await
        .map_err(|e| Error::session_failed("start_scan", e))?;

    radio
        .start_scan(ScanFilter {
            services: services.to_vec(),
        })
        .await
        .map_err(|e| Error::session_failed("start_scan", e))?;

    Ok(events)
}

/// Whether `device` passes a service filter. An empty filter passes all.
fn matches_filter(device: &DiscoveredDevice, filter: &[Uuid]) -> bool {
    filter.is_empty() || filter.iter().any(|service| device.advertises(service))
}

fn find_characteristic(peripheral: &Peripheral, uuid: &Uuid) -> Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == *uuid)
        .ok_or_else(|| Error::CharacteristicNotFound {
            uuid: uuid.to_string(),
        })
}

#[async_trait]
impl CentralSession for BtleplugCentralSession {
    async fn start_scan(&self, services: &[Uuid]) -> Result<()> {
        self.ensure_open("start_scan")?;

        let mut scan = self.scan.lock().await;
        if scan.refs > 0 {
            scan.refs += 1;
            debug!("Scan already active, {} references", scan.refs);
            return Ok(());
        }

        info!("Starting BLE scan");

        let mut events = open_scan(&self.adapter, services).await?;

        let adapter = self.adapter.clone();
        let filter = services.to_vec();
        let peripherals = self.peripherals.clone();
        let discovered = self.discovered.clone();
        let links = self.links.clone();
        let discovery_tx = self.discovery_tx.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                Self::handle_event(
                    event,
                    &adapter,
                    &filter,
                    &peripherals,
                    &discovered,
                    &links,
                    &discovery_tx,
                )
                .await;
            }

            debug!("Scan event loop ended");
        });

        scan.refs = 1;
        scan.handle = Some(handle);
        self.is_scanning.store(true, Ordering::SeqCst);

        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.ensure_open("stop_scan")?;

        let mut scan = self.scan.lock().await;
        match scan.refs {
            0 => {
                debug!("Not scanning, ignoring stop request");
                return Ok(());
            }
            1 => {}
            _ => {
                scan.refs -= 1;
                return Ok(());
            }
        }

        info!("Stopping BLE scan");

        scan.refs = 0;
        self.is_scanning.store(false, Ordering::SeqCst);
        if let Some(handle) = scan.handle.take() {
            handle.abort();
        }

        self.adapter
            .stop_scan()
            .await
            .map_err(|e| Error::session_failed("stop_scan", e))
    }

    fn is_scanning(&self) -> bool {
        self.is_scanning.load(Ordering::SeqCst)
    }

    fn discovered(&self) -> Vec<DiscoveredDevice> {
        self.discovered.read().values().cloned().collect()
    }

    fn subscribe_discoveries(&self) -> broadcast::Receiver<DiscoveredDevice> {
        self.discovery_tx.subscribe()
    }

    async fn connect(&self, address: &PeerAddress) -> Result<()> {
        self.ensure_open("connect")?;

        let peripheral = self.peripheral(address)?;

        if peripheral.is_connected().await.unwrap_or(false) {
            debug!("Peripheral {} already connected at BLE level", address);
        } else {
            peripheral
                .connect()
                .await
                .map_err(|e| Error::session_failed("connect", e))?;
        }

        peripheral
            .discover_services()
            .await
            .map_err(|e| Error::session_failed("discover_services", e))?;

        let notify = find_characteristic(&peripheral, &self.gatt.notify_uuid)?;
        peripheral
            .subscribe(&notify)
            .await
            .map_err(|e| Error::session_failed("subscribe", e))?;

        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| Error::session_failed("notifications", e))?;

        let data_tx = self.data_tx.clone();
        let source = address.clone();
        let notify_uuid = self.gatt.notify_uuid;

        let handle = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != notify_uuid {
                    continue;
                }
                let _ = data_tx.send(InboundData {
                    address: source.clone(),
                    data: Bytes::from(notification.value),
                });
            }

            debug!("Notification stream for {} ended", source);
        });

        if let Some(previous) = self.links.write().insert(address.clone(), handle) {
            previous.abort();
        }

        info!("Connected to {}", address);

        Ok(())
    }

    async fn disconnect(&self, address: &PeerAddress) -> Result<()> {
        self.ensure_open("disconnect")?;

        if let Some(handle) = self.links.write().remove(address) {
            handle.abort();
        }

        let peripheral = self.peripheral(address)?;
        peripheral
            .disconnect()
            .await
            .map_err(|e| Error::session_failed("disconnect", e))?;

        info!("Disconnected from {}", address);

        Ok(())
    }

    async fn write(&self, address: &PeerAddress, data: &[u8]) -> Result<()> {
        self.ensure_open("write")?;

        if !self.links.read().contains_key(address) {
            return Err(Error::NotConnected {
                address: address.to_string(),
            });
        }

        let peripheral = self.peripheral(address)?;
        let characteristic = find_characteristic(&peripheral, &self.gatt.write_uuid)?;

        peripheral
            .write(&characteristic, data, WriteType::WithResponse)
            .await
            .map_err(|e| Error::session_failed("write", e))?;

        trace!("Wrote {} bytes to {}", data.len(), address);

        Ok(())
    }

    fn subscribe_data(&self) -> broadcast::Receiver<InboundData> {
        self.data_tx.subscribe()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Closing central session");

        let was_scanning = {
            let mut scan = self.scan.lock().await;
            if let Some(handle) = scan.handle.take() {
                handle.abort();
            }
            std::mem::take(&mut scan.refs) > 0
        };
        self.is_scanning.store(false, Ordering::SeqCst);

        if was_scanning {
            if let Err(e) = self.adapter.stop_scan().await {
                warn!("Error stopping scan: {}", e);
            }
        }

        let links: Vec<_> = self.links.write().drain().collect();
        for (address, handle) in links {
            handle.abort();
            let peripheral = self.peripherals.read().get(&address).cloned();
            if let Some(peripheral) = peripheral {
                if let Err(e) = peripheral.disconnect().await {
                    warn!("Error disconnecting {}: {}", address, e);
                }
            }
        }

        Ok(())
    }
}

impl Drop for BtleplugCentralSession {
    fn drop(&mut self) {
        if let Some(handle) = self.scan.get_mut().handle.take() {
            handle.abort();
        }
        for (_, handle) in self.links.write().drain() {
            handle.abort();
        }
    }
}
