//! Peripheral session backed by BlueZ (via bluer).
//!
//! Serves one GATT application for the configured profile and advertises
//! service data under the profile's service UUID:
//!
//! - write characteristic: data from the central, forwarded as [`InboundData`]
//! - notify characteristic: data sent with [`PeripheralSession::send`]
//! - additional data characteristic: read-only, the additional advertisement
//!   data of the current advertisement

use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle, Type as AdvertisementType};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite, CharacteristicWriteMethod,
    Service,
};
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::config::{GattProfile, ProvisionerConfig};
use crate::error::{Error, Result};
use crate::role::Role;
use crate::session::{AdvertisementRequest, InboundData, PeerAddress, PeripheralSession};

/// Peripheral session on the default BlueZ adapter.
pub struct BluezPeripheralSession {
    /// Keeps the D-Bus connection alive.
    _session: bluer::Session,
    adapter: bluer::Adapter,
    gatt: GattProfile,
    local_name: Option<String>,
    /// Dropping the handle stops advertising.
    advertisement: Mutex<Option<AdvertisementHandle>>,
    is_advertising: AtomicBool,
    /// Dropping the handle unregisters the GATT application.
    application: Mutex<Option<ApplicationHandle>>,
    /// Served by the additional data characteristic.
    additional_data: Arc<RwLock<Option<Bytes>>>,
    /// Set when a central subscribes to the notify characteristic.
    notifier: Arc<Mutex<Option<CharacteristicNotifier>>>,
    data_tx: broadcast::Sender<InboundData>,
    closed: AtomicBool,
}

impl BluezPeripheralSession {
    /// Power the default adapter and register the GATT application.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HardwareUnavailable`] if BlueZ is not reachable or
    /// the adapter refuses the application.
    pub async fn new(config: &ProvisionerConfig) -> Result<Self> {
        let unavailable = |e: bluer::Error| Error::hardware_unavailable(Role::Peripheral, e);

        let session = bluer::Session::new().await.map_err(unavailable)?;
        let adapter = session.default_adapter().await.map_err(unavailable)?;
        adapter.set_powered(true).await.map_err(unavailable)?;

        info!("Using Bluetooth adapter {} for peripheral role", adapter.name());

        let (data_tx, _) = broadcast::channel(256);
        let additional_data = Arc::new(RwLock::new(None));
        let notifier = Arc::new(Mutex::new(None));

        let application = build_application(
            &config.gatt,
            additional_data.clone(),
            notifier.clone(),
            data_tx.clone(),
        );
        let application = adapter
            .serve_gatt_application(application)
            .await
            .map_err(unavailable)?;

        Ok(Self {
            _session: session,
            adapter,
            gatt: config.gatt,
            local_name: config.local_name.clone(),
            advertisement: Mutex::new(None),
            is_advertising: AtomicBool::new(false),
            application: Mutex::new(Some(application)),
            additional_data,
            notifier,
            data_tx,
            closed: AtomicBool::new(false),
        })
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &bluer::Adapter {
        &self.adapter
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::session_failed(operation, "session closed"));
        }
        Ok(())
    }
}

fn build_application(
    gatt: &GattProfile,
    additional_data: Arc<RwLock<Option<Bytes>>>,
    notifier: Arc<Mutex<Option<CharacteristicNotifier>>>,
    data_tx: broadcast::Sender<InboundData>,
) -> Application {
    let write = Characteristic {
        uuid: gatt.write_uuid,
        write: Some(CharacteristicWrite {
            write: true,
            write_without_response: true,
            method: CharacteristicWriteMethod::Fun(Box::new(move |value, request| {
                let data_tx = data_tx.clone();
                async move {
                    let _ = data_tx.send(InboundData {
                        address: PeerAddress::new(request.device_address.to_string()),
                        data: Bytes::from(value),
                    });
                    Ok(())
                }
                .boxed()
            })),
            ..Default::default()
        }),
        ..Default::default()
    };

    let notify = Characteristic {
        uuid: gatt.notify_uuid,
        notify: Some(CharacteristicNotify {
            notify: true,
            indicate: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |new_notifier| {
                let notifier = notifier.clone();
                async move {
                    debug!("Central subscribed to notifications");
                    *notifier.lock().await = Some(new_notifier);
                }
                .boxed()
            })),
            ..Default::default()
        }),
        ..Default::default()
    };

    let additional = Characteristic {
        uuid: gatt.additional_data_uuid,
        read: Some(CharacteristicRead {
            read: true,
            fun: Box::new(move |_request| {
                let value = additional_data
                    .read()
                    .as_ref()
                    .map(|data| data.to_vec())
                    .unwrap_or_default();
                async move { Ok(value) }.boxed()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    Application {
        services: vec![Service {
            uuid: gatt.service_uuid,
            primary: true,
            characteristics: vec![write, notify, additional],
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[async_trait]
impl PeripheralSession for BluezPeripheralSession {
    async fn start_advertising(&self, request: &AdvertisementRequest) -> Result<()> {
        self.ensure_open("start_advertising")?;

        *self.additional_data.write() = request.additional_data.clone();

        let advertisement = Advertisement {
            advertisement_type: AdvertisementType::Peripheral,
            service_uuids: [self.gatt.service_uuid].into_iter().collect(),
            service_data: BTreeMap::from([(self.gatt.service_uuid, request.payload.to_vec())]),
            discoverable: Some(true),
            local_name: request.local_name.clone().or_else(|| self.local_name.clone()),
            ..Default::default()
        };

        let handle = self
            .adapter
            .advertise(advertisement)
            .await
            .map_err(|e| Error::session_failed("start_advertising", e))?;

        // Replacing the handle drops the previous advertisement.
        *self.advertisement.lock().await = Some(handle);
        self.is_advertising.store(true, Ordering::SeqCst);

        info!(
            "Advertising {} bytes of service data (interval {:?})",
            request.payload.len(),
            request.interval
        );

        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        self.ensure_open("stop_advertising")?;

        if self.advertisement.lock().await.take().is_some() {
            info!("Stopped advertising");
        }
        self.is_advertising.store(false, Ordering::SeqCst);

        Ok(())
    }

    fn is_advertising(&self) -> bool {
        self.is_advertising.load(Ordering::SeqCst)
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        self.ensure_open("send")?;

        let mut notifier = self.notifier.lock().await;
        let active = notifier
            .as_mut()
            .filter(|n| !n.is_stopped())
            .ok_or_else(|| Error::NotConnected {
                address: "subscribed central".to_string(),
            })?;

        active
            .notify(data.to_vec())
            .await
            .map_err(|e| Error::session_failed("send", e))
    }

    fn subscribe_data(&self) -> broadcast::Receiver<InboundData> {
        self.data_tx.subscribe()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Closing peripheral session");

        self.advertisement.lock().await.take();
        self.is_advertising.store(false, Ordering::SeqCst);
        self.notifier.lock().await.take();
        if self.application.lock().await.take().is_none() {
            warn!("GATT application already unregistered");
        }

        Ok(())
    }
}
