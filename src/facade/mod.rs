//! Capability facades.
//!
//! Each facade is a thin, disposable view over a shared session that exposes
//! only the operations one kind of consumer needs. Facades forward to the
//! session and never tear it down.
//!
//! | Capability           | Trait                  | Struct                      | Session    |
//! |----------------------|------------------------|-----------------------------|------------|
//! | Transport interface  | [`TransportInterface`] | [`PeripheralTransport`]     | Peripheral |
//! | Broadcaster          | [`Broadcaster`]        | [`BleBroadcaster`]          | Peripheral |
//! | Network interface    | [`NetworkInterface`]   | [`CentralNetworkInterface`] | Central    |
//! | Scanner              | [`Scanner`]            | [`BleScanner`]              | Central    |

pub mod broadcaster;
pub mod network;
pub mod scanner;
pub mod transport;

pub use broadcaster::BleBroadcaster;
pub use network::{BleChannel, CentralNetworkInterface};
pub use scanner::{BleScanner, ScanRequest};
pub use transport::PeripheralTransport;

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::callback::CallbackHandle;
use crate::error::Result;
use crate::session::{DiscoveredDevice, InboundData, PeerAddress};

/// Message transport over the peripheral role's GATT server.
#[async_trait]
pub trait TransportInterface: Send + Sync {
    /// Send data to the subscribed central.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Subscribe to data written by centrals.
    fn subscribe(&self) -> broadcast::Receiver<InboundData>;

    /// Register a callback for inbound data.
    ///
    /// Must be called from within a tokio runtime.
    fn on_data<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(InboundData) + Send + Sync + 'static,
        Self: Sized,
    {
        spawn_data_callback(self.subscribe(), callback)
    }
}

/// Announces the local device over the peripheral role.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Start (or replace) the announcement with `advertisement` as service data.
    async fn announce(&self, advertisement: &[u8]) -> Result<()>;

    /// Stop announcing.
    async fn stop(&self) -> Result<()>;

    /// Whether the underlying session is advertising.
    fn is_announcing(&self) -> bool;

    /// Additional advertisement data attached to every announcement.
    fn additional_advertisement_data(&self) -> Option<&[u8]>;
}

/// Connection-oriented access to peers over the central role.
#[async_trait]
pub trait NetworkInterface: Send + Sync {
    /// Connect to a discovered peer.
    async fn open_channel(&self, address: &PeerAddress) -> Result<BleChannel>;

    /// Subscribe to notifications from connected peers.
    fn subscribe(&self) -> broadcast::Receiver<InboundData>;

    /// Register a callback for inbound data.
    ///
    /// Must be called from within a tokio runtime.
    fn on_data<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(InboundData) + Send + Sync + 'static,
        Self: Sized,
    {
        spawn_data_callback(self.subscribe(), callback)
    }
}

/// Device discovery over the central role.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Scan for the request's window and return every matching device.
    async fn find_devices(&self, request: &ScanRequest) -> Result<Vec<DiscoveredDevice>>;

    /// Scan until the first matching device or the end of the window.
    async fn find_first(&self, request: &ScanRequest) -> Result<Option<DiscoveredDevice>>;

    /// All devices the session has discovered so far.
    fn discovered_devices(&self) -> Vec<DiscoveredDevice>;
}

/// Forward every message on `rx` to `callback` until the handle is dropped.
fn spawn_data_callback<F>(mut rx: broadcast::Receiver<InboundData>, callback: F) -> CallbackHandle
where
    F: Fn(InboundData) + Send + Sync + 'static,
{
    let handle = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(data) => callback(data),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Data callback lagged, {} messages dropped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    CallbackHandle::new(move || {
        handle.abort();
    })
}
