//! Hardware session contracts.
//!
//! A session owns the live driver handle for one [`Role`](crate::Role).
//! Sessions are expensive to create and safe to share. The provisioner holds
//! at most one per role and hands them to capability facades as
//! `Arc<dyn …Session>`.
//!
//! Backends:
//!
//! - [`btleplug_central`]: cross-platform central session (btleplug).
//! - `bluez_peripheral`: BlueZ peripheral session (feature `bluez`, Linux only).
//! - [`loopback`]: in-memory sessions for tests and dry runs.

pub mod btleplug_central;
#[cfg(all(feature = "bluez", target_os = "linux"))]
pub mod bluez_peripheral;
pub mod loopback;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::ProvisionerConfig;
use crate::error::Result;

/// Platform identifier of a remote BLE device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeerAddress(String);

impl PeerAddress {
    /// Create a peer address from its platform string form.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// The platform string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeerAddress {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A device seen by the central session while scanning.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredDevice {
    /// Address to connect to.
    pub address: PeerAddress,
    /// Advertised local name.
    pub local_name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
    /// Advertised service data, keyed by service UUID.
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// When the device was last reported.
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredDevice {
    /// Create a device record with no advertisement contents.
    pub fn new(address: impl Into<PeerAddress>) -> Self {
        Self {
            address: address.into(),
            local_name: None,
            rssi: None,
            services: Vec::new(),
            service_data: HashMap::new(),
            last_seen: Utc::now(),
        }
    }

    /// Check if the device advertises `service`, either as a service UUID or
    /// as a service data key.
    pub fn advertises(&self, service: &Uuid) -> bool {
        self.services.contains(service) || self.service_data.contains_key(service)
    }
}

/// Data received from a peer over the GATT link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundData {
    /// The peer that sent the data.
    pub address: PeerAddress,
    /// The received bytes.
    pub data: Bytes,
}

/// What the peripheral session should advertise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementRequest {
    /// Service data for the profile's service UUID.
    pub payload: Bytes,
    /// Additional advertisement data served alongside the advertisement.
    pub additional_data: Option<Bytes>,
    /// Advertising interval.
    pub interval: Duration,
    /// Local name override.
    pub local_name: Option<String>,
}

impl AdvertisementRequest {
    /// Create a request for `payload` at `interval`.
    pub fn new(payload: impl Into<Bytes>, interval: Duration) -> Self {
        Self {
            payload: payload.into(),
            additional_data: None,
            interval,
            local_name: None,
        }
    }

    /// Attach additional advertisement data.
    pub fn with_additional_data(mut self, data: Option<Bytes>) -> Self {
        self.additional_data = data;
        self
    }

    /// Override the advertised local name.
    pub fn with_local_name(mut self, name: Option<String>) -> Self {
        self.local_name = name;
        self
    }
}

/// The single advertiser/server hardware session.
///
/// `close` must be idempotent; every other operation fails with
/// [`Error::SessionOperationFailed`](crate::Error::SessionOperationFailed)
/// once the session is closed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeripheralSession: Send + Sync {
    /// Start (or replace) the current advertisement.
    async fn start_advertising(&self, request: &AdvertisementRequest) -> Result<()>;

    /// Stop advertising. Not an error when nothing is advertised.
    async fn stop_advertising(&self) -> Result<()>;

    /// Whether an advertisement is active.
    fn is_advertising(&self) -> bool;

    /// Send data to the subscribed central.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Subscribe to data written by centrals.
    fn subscribe_data(&self) -> broadcast::Receiver<InboundData>;

    /// Release the hardware handle.
    async fn close(&self) -> Result<()>;
}

/// The single scanner/client hardware session.
///
/// Scans are reference counted: every `start_scan` must be paired with a
/// `stop_scan`, and the radio scan stops when the last one is released.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CentralSession: Send + Sync {
    /// Start scanning, reporting devices that advertise any of `services`
    /// (all devices when empty).
    async fn start_scan(&self, services: &[Uuid]) -> Result<()>;

    /// Release one scan reference.
    async fn stop_scan(&self) -> Result<()>;

    /// Whether a radio scan is active.
    fn is_scanning(&self) -> bool;

    /// All devices discovered so far.
    fn discovered(&self) -> Vec<DiscoveredDevice>;

    /// Subscribe to discovery events.
    fn subscribe_discoveries(&self) -> broadcast::Receiver<DiscoveredDevice>;

    /// Connect to a discovered peer and subscribe to its notifications.
    async fn connect(&self, address: &PeerAddress) -> Result<()>;

    /// Disconnect from one peer.
    async fn disconnect(&self, address: &PeerAddress) -> Result<()>;

    /// Write to the peer's write characteristic.
    async fn write(&self, address: &PeerAddress, data: &[u8]) -> Result<()>;

    /// Subscribe to notifications from connected peers.
    fn subscribe_data(&self) -> broadcast::Receiver<InboundData>;

    /// Release the hardware handle.
    async fn close(&self) -> Result<()>;
}

/// Whether two handles point at the same session object.
///
/// Compares data pointers only, so a concrete `Arc<S>` and the
/// `Arc<dyn …Session>` made from it compare equal.
pub fn is_same_session<A: ?Sized, B: ?Sized>(a: &Arc<A>, b: &Arc<B>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Creates the peripheral session on first demand.
#[async_trait]
pub trait PeripheralSessionFactory: Send + Sync {
    /// Construct a new session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HardwareUnavailable`](crate::Error::HardwareUnavailable)
    /// when the driver cannot provide the role.
    async fn create(&self, config: &ProvisionerConfig) -> Result<Arc<dyn PeripheralSession>>;
}

/// Creates the central session on first demand.
#[async_trait]
pub trait CentralSessionFactory: Send + Sync {
    /// Construct a new session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HardwareUnavailable`](crate::Error::HardwareUnavailable)
    /// when the driver cannot provide the role.
    async fn create(&self, config: &ProvisionerConfig) -> Result<Arc<dyn CentralSession>>;
}

/// Peripheral factory for the platform's native stack.
///
/// Builds a BlueZ session when the `bluez` feature is enabled on Linux, and
/// reports the role as unavailable everywhere else.
#[derive(Debug, Default, Clone, Copy)]
pub struct HardwarePeripheralFactory;

#[async_trait]
impl PeripheralSessionFactory for HardwarePeripheralFactory {
    #[cfg(all(feature = "bluez", target_os = "linux"))]
    async fn create(&self, config: &ProvisionerConfig) -> Result<Arc<dyn PeripheralSession>> {
        let session = bluez_peripheral::BluezPeripheralSession::new(config).await?;
        Ok(Arc::new(session))
    }

    #[cfg(not(all(feature = "bluez", target_os = "linux")))]
    async fn create(&self, _config: &ProvisionerConfig) -> Result<Arc<dyn PeripheralSession>> {
        Err(crate::error::Error::hardware_unavailable(
            crate::role::Role::Peripheral,
            "no peripheral backend built for this platform",
        ))
    }
}

/// Central factory for the platform's native stack (btleplug).
#[derive(Debug, Default, Clone, Copy)]
pub struct HardwareCentralFactory;

#[async_trait]
impl CentralSessionFactory for HardwareCentralFactory {
    async fn create(&self, config: &ProvisionerConfig) -> Result<Arc<dyn CentralSession>> {
        let session = btleplug_central::BtleplugCentralSession::new(config).await?;
        Ok(Arc::new(session))
    }
}
