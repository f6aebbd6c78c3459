//! In-memory sessions.
//!
//! Loopback sessions behave like hardware sessions without touching a radio.
//! The peripheral records what it is asked to advertise and send. The central
//! reports peers registered with [`LoopbackCentralSession::add_peer`] while
//! scanning, and records writes. The factories count constructions and can
//! inject failures or delays.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::ProvisionerConfig;
use crate::error::{Error, Result};
use crate::role::Role;
use crate::session::{
    AdvertisementRequest, CentralSession, CentralSessionFactory, DiscoveredDevice, InboundData,
    PeerAddress, PeripheralSession, PeripheralSessionFactory,
};

/// In-memory peripheral session.
pub struct LoopbackPeripheralSession {
    advertisement: RwLock<Option<AdvertisementRequest>>,
    sent: RwLock<Vec<Bytes>>,
    data_tx: broadcast::Sender<InboundData>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl LoopbackPeripheralSession {
    /// Create an open session.
    pub fn new() -> Self {
        let (data_tx, _) = broadcast::channel(64);

        Self {
            advertisement: RwLock::new(None),
            sent: RwLock::new(Vec::new()),
            data_tx,
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        }
    }

    /// The active advertisement, if any.
    pub fn advertisement(&self) -> Option<AdvertisementRequest> {
        self.advertisement.read().clone()
    }

    /// Everything passed to `send`, in order.
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.read().clone()
    }

    /// Deliver data as if a central had written it.
    pub fn inject_data(&self, address: impl Into<PeerAddress>, data: impl Into<Bytes>) {
        let _ = self.data_tx.send(InboundData {
            address: address.into(),
            data: data.into(),
        });
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of `close` calls, including repeated ones.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::session_failed(operation, "session closed"));
        }
        Ok(())
    }
}

impl Default for LoopbackPeripheralSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeripheralSession for LoopbackPeripheralSession {
    async fn start_advertising(&self, request: &AdvertisementRequest) -> Result<()> {
        self.ensure_open("start_advertising")?;
        trace!("Loopback advertising {} bytes", request.payload.len());
        *self.advertisement.write() = Some(request.clone());
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        self.ensure_open("stop_advertising")?;
        *self.advertisement.write() = None;
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        self.advertisement.read().is_some()
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        self.ensure_open("send")?;
        self.sent.write().push(Bytes::copy_from_slice(data));
        Ok(())
    }

    fn subscribe_data(&self) -> broadcast::Receiver<InboundData> {
        self.data_tx.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Loopback peripheral session closed");
            *self.advertisement.write() = None;
        }
        Ok(())
    }
}

/// In-memory central session.
pub struct LoopbackCentralSession {
    /// Peers "in the air", reported while scanning.
    peers: RwLock<HashMap<PeerAddress, DiscoveredDevice>>,
    /// Active scan references and the filter of the first one.
    scan: RwLock<(usize, Vec<Uuid>)>,
    discovered: RwLock<HashMap<PeerAddress, DiscoveredDevice>>,
    connected: RwLock<HashSet<PeerAddress>>,
    writes: RwLock<Vec<(PeerAddress, Bytes)>>,
    discovery_tx: broadcast::Sender<DiscoveredDevice>,
    data_tx: broadcast::Sender<InboundData>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl LoopbackCentralSession {
    /// Create an open session with no peers.
    pub fn new() -> Self {
        let (discovery_tx, _) = broadcast::channel(64);
        let (data_tx, _) = broadcast::channel(64);

        Self {
            peers: RwLock::new(HashMap::new()),
            scan: RwLock::new((0, Vec::new())),
            discovered: RwLock::new(HashMap::new()),
            connected: RwLock::new(HashSet::new()),
            writes: RwLock::new(Vec::new()),
            discovery_tx,
            data_tx,
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        }
    }

    /// Register a peer. It is reported immediately when a scan is active,
    /// otherwise when the next scan starts.
    pub fn add_peer(&self, device: DiscoveredDevice) {
        self.peers
            .write()
            .insert(device.address.clone(), device.clone());

        let filter = {
            let scan = self.scan.read();
            if scan.0 == 0 {
                return;
            }
            scan.1.clone()
        };
        self.report(device, &filter);
    }

    /// Deliver a notification as if a connected peer had sent it.
    pub fn inject_data(&self, address: impl Into<PeerAddress>, data: impl Into<Bytes>) {
        let _ = self.data_tx.send(InboundData {
            address: address.into(),
            data: data.into(),
        });
    }

    /// Everything written, in order.
    pub fn writes(&self) -> Vec<(PeerAddress, Bytes)> {
        self.writes.read().clone()
    }

    /// Currently connected peers.
    pub fn connected(&self) -> Vec<PeerAddress> {
        let mut peers: Vec<_> = self.connected.read().iter().cloned().collect();
        peers.sort();
        peers
    }

    /// Number of outstanding scan references.
    pub fn scan_refs(&self) -> usize {
        self.scan.read().0
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of `close` calls, including repeated ones.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::session_failed(operation, "session closed"));
        }
        Ok(())
    }

    fn ensure_discovered(&self, address: &PeerAddress) -> Result<()> {
        if !self.discovered.read().contains_key(address) {
            return Err(Error::PeerNotFound {
                address: address.to_string(),
            });
        }
        Ok(())
    }

    fn report(&self, device: DiscoveredDevice, filter: &[Uuid]) {
        if !filter.is_empty() && !filter.iter().any(|s| device.advertises(s)) {
            return;
        }
        self.discovered
            .write()
            .insert(device.address.clone(), device.clone());
        let _ = self.discovery_tx.send(device);
    }
}

impl Default for LoopbackCentralSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CentralSession for LoopbackCentralSession {
    async fn start_scan(&self, services: &[Uuid]) -> Result<()> {
        self.ensure_open("start_scan")?;

        // Peers advertise continuously, so every new scan reference sees
        // them again under the filter of the scan already running.
        let filter = {
            let mut scan = self.scan.write();
            scan.0 += 1;
            if scan.0 == 1 {
                scan.1 = services.to_vec();
            }
            scan.1.clone()
        };

        let peers: Vec<_> = self.peers.read().values().cloned().collect();
        for device in peers {
            self.report(device, &filter);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.ensure_open("stop_scan")?;
        let mut scan = self.scan.write();
        scan.0 = scan.0.saturating_sub(1);
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        self.scan.read().0 > 0
    }

    fn discovered(&self) -> Vec<DiscoveredDevice> {
        self.discovered.read().values().cloned().collect()
    }

    fn subscribe_discoveries(&self) -> broadcast::Receiver<DiscoveredDevice> {
        self.discovery_tx.subscribe()
    }

    async fn connect(&self, address: &PeerAddress) -> Result<()> {
        self.ensure_open("connect")?;
        self.ensure_discovered(address)?;
        self.connected.write().insert(address.clone());
        Ok(())
    }

    async fn disconnect(&self, address: &PeerAddress) -> Result<()> {
        self.ensure_open("disconnect")?;
        self.ensure_discovered(address)?;
        self.connected.write().remove(address);
        Ok(())
    }

    async fn write(&self, address: &PeerAddress, data: &[u8]) -> Result<()> {
        self.ensure_open("write")?;
        if !self.connected.read().contains(address) {
            return Err(Error::NotConnected {
                address: address.to_string(),
            });
        }
        self.writes
            .write()
            .push((address.clone(), Bytes::copy_from_slice(data)));
        Ok(())
    }

    fn subscribe_data(&self) -> broadcast::Receiver<InboundData> {
        self.data_tx.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Loopback central session closed");
            self.scan.write().0 = 0;
            self.connected.write().clear();
        }
        Ok(())
    }
}

/// Factory producing loopback sessions of type `S`.
pub struct LoopbackFactory<S> {
    attempts: AtomicUsize,
    failures_remaining: AtomicUsize,
    delay: Option<Duration>,
    sessions: RwLock<Vec<Arc<S>>>,
    _session: PhantomData<fn() -> S>,
}

/// Loopback factory for the peripheral role.
pub type LoopbackPeripheralFactory = LoopbackFactory<LoopbackPeripheralSession>;

/// Loopback factory for the central role.
pub type LoopbackCentralFactory = LoopbackFactory<LoopbackCentralSession>;

impl<S: Default> LoopbackFactory<S> {
    /// Create a factory that always succeeds immediately.
    pub fn new() -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(0),
            delay: None,
            sessions: RwLock::new(Vec::new()),
            _session: PhantomData,
        }
    }

    /// Wait `delay` before every construction.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next `count` constructions.
    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of construction attempts, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Number of sessions successfully constructed.
    pub fn created(&self) -> usize {
        self.sessions.read().len()
    }

    /// Sessions constructed so far, oldest first.
    pub fn sessions(&self) -> Vec<Arc<S>> {
        self.sessions.read().clone()
    }

    async fn build(&self, role: Role) -> Result<Arc<S>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            debug!("Loopback {} construction attempt {} failed", role, attempt);
            return Err(Error::hardware_unavailable(role, "injected failure"));
        }

        let session = Arc::new(S::default());
        self.sessions.write().push(session.clone());
        debug!("Loopback {} session constructed on attempt {}", role, attempt);
        Ok(session)
    }
}

impl<S: Default> Default for LoopbackFactory<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeripheralSessionFactory for LoopbackPeripheralFactory {
    async fn create(&self, _config: &ProvisionerConfig) -> Result<Arc<dyn PeripheralSession>> {
        let session: Arc<dyn PeripheralSession> = self.build(Role::Peripheral).await?;
        Ok(session)
    }
}

#[async_trait]
impl CentralSessionFactory for LoopbackCentralFactory {
    async fn create(&self, _config: &ProvisionerConfig) -> Result<Arc<dyn CentralSession>> {
        let session: Arc<dyn CentralSession> = self.build(Role::Central).await?;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn device(address: &str, service: Option<Uuid>) -> DiscoveredDevice {
        let mut device = DiscoveredDevice::new(address);
        device.services.extend(service);
        device
    }

    #[tokio::test]
    async fn test_peripheral_records_advertisement_and_sends() {
        let session = LoopbackPeripheralSession::new();
        let request = AdvertisementRequest::new(vec![1, 2, 3], Duration::from_millis(100));

        session.start_advertising(&request).await.unwrap();
        assert!(session.is_advertising());
        assert_eq!(session.advertisement(), Some(request));

        session.send(&[9]).await.unwrap();
        assert_eq!(session.sent(), vec![Bytes::from_static(&[9])]);

        session.stop_advertising().await.unwrap();
        assert!(!session.is_advertising());
    }

    #[tokio::test]
    async fn test_peripheral_close_is_idempotent() {
        let session = LoopbackPeripheralSession::new();
        session.close().await.unwrap();
        session.close().await.unwrap();

        assert!(session.is_closed());
        assert_eq!(session.close_calls(), 2);
        assert!(matches!(
            session.send(&[1]).await,
            Err(Error::SessionOperationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_central_reports_peers_while_scanning() {
        let service = Uuid::from_u128(0xFFF6);
        let session = LoopbackCentralSession::new();
        session.add_peer(device("before", Some(service)));
        assert!(session.discovered().is_empty());

        let mut rx = session.subscribe_discoveries();
        session.start_scan(&[service]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().address, PeerAddress::from("before"));

        session.add_peer(device("during", Some(service)));
        assert_eq!(rx.recv().await.unwrap().address, PeerAddress::from("during"));

        session.add_peer(device("filtered", None));
        assert_eq!(session.discovered().len(), 2);
    }

    #[tokio::test]
    async fn test_central_scan_is_reference_counted() {
        let session = LoopbackCentralSession::new();
        session.start_scan(&[]).await.unwrap();
        session.start_scan(&[]).await.unwrap();
        assert_eq!(session.scan_refs(), 2);

        session.stop_scan().await.unwrap();
        assert!(session.is_scanning());
        session.stop_scan().await.unwrap();
        assert!(!session.is_scanning());
    }

    #[tokio::test]
    async fn test_central_connect_and_write() {
        let session = LoopbackCentralSession::new();
        let address = PeerAddress::from("peer");

        assert!(matches!(
            session.connect(&address).await,
            Err(Error::PeerNotFound { .. })
        ));

        session.add_peer(device("peer", None));
        session.start_scan(&[]).await.unwrap();

        assert!(matches!(
            session.write(&address, &[1]).await,
            Err(Error::NotConnected { .. })
        ));

        session.connect(&address).await.unwrap();
        session.write(&address, &[1, 2]).await.unwrap();
        assert_eq!(
            session.writes(),
            vec![(address.clone(), Bytes::from_static(&[1, 2]))]
        );

        session.disconnect(&address).await.unwrap();
        assert!(session.connected().is_empty());
    }

    #[tokio::test]
    async fn test_factory_failures_then_success() {
        let factory = LoopbackCentralFactory::new();
        factory.fail_next(2);
        let config = ProvisionerConfig::default();

        assert!(factory.create(&config).await.is_err());
        assert!(factory.create(&config).await.is_err());
        assert!(factory.create(&config).await.is_ok());

        assert_eq!(factory.attempts(), 3);
        assert_eq!(factory.created(), 1);
    }
}
