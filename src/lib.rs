// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-role-provisioner
//!
//! Lazily provisioned BLE hardware sessions for commissioning transports.
//!
//! A device that is being commissioned over BLE needs up to two radio roles:
//! a **peripheral** that advertises and serves GATT to a commissioner, and a
//! **central** that scans for and connects to other nodes. Each role is backed
//! by one expensive, exclusive driver session. [`RoleProvisioner`] creates a
//! role's session the first time any of its capabilities is requested and
//! shares that session with every capability handed out afterwards.
//!
//! ## Capabilities
//!
//! | Role       | Capability                                   | Facade                        |
//! |------------|----------------------------------------------|-------------------------------|
//! | Peripheral | [`TransportInterface`]                       | [`PeripheralTransport`]       |
//! | Peripheral | [`Broadcaster`]                              | [`BleBroadcaster`]            |
//! | Central    | [`NetworkInterface`]                         | [`CentralNetworkInterface`]   |
//! | Central    | [`Scanner`]                                  | [`BleScanner`]                |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_role_provisioner::{ProvisionerConfig, Result, RoleProvisioner, ScanRequest, Scanner};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let provisioner = RoleProvisioner::new(ProvisionerConfig::default())?;
//!
//!     // The central session is created here, on first use.
//!     let scanner = provisioner.scanner().await?;
//!     let request = ScanRequest::from_config(provisioner.config());
//!
//!     for device in scanner.find_devices(&request).await? {
//!         println!("Found {} ({:?})", device.address, device.local_name);
//!     }
//!
//!     provisioner.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### Central role
//! Uses btleplug on Linux (BlueZ), macOS and Windows. On macOS the process
//! needs `NSBluetoothAlwaysUsageDescription` in its Info.plist.
//!
//! ### Peripheral role
//! Only available on Linux with the `bluez` feature. Everywhere else the
//! peripheral capabilities fail with [`Error::HardwareUnavailable`].
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types
//! - `bluez`: Enable the BlueZ peripheral backend (Linux only)

// Public modules
pub mod callback;
pub mod config;
pub mod error;
pub mod facade;
pub mod provisioner;
pub mod role;
pub mod session;
pub mod utils;
pub mod uuids;

// Re-exports for convenience
pub use callback::CallbackHandle;
pub use config::{GattProfile, ProvisionerConfig};
pub use error::{Error, Result};
pub use facade::{
    BleBroadcaster, BleChannel, BleScanner, Broadcaster, CentralNetworkInterface, NetworkInterface,
    PeripheralTransport, ScanRequest, Scanner, TransportInterface,
};
pub use provisioner::RoleProvisioner;
pub use role::Role;
pub use session::{
    is_same_session, AdvertisementRequest, CentralSession, CentralSessionFactory,
    DiscoveredDevice, InboundData, PeerAddress, PeripheralSession, PeripheralSessionFactory,
};
pub use utils::{camelize, feature_bitmap, translate_bitmap, FeatureBitmap};
