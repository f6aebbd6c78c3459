//! Scanner facade over the central session.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ProvisionerConfig;
use crate::error::Result;
use crate::facade::Scanner;
use crate::session::{CentralSession, DiscoveredDevice, PeerAddress};

/// What to scan for, and for how long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    /// Services of interest; empty means any device.
    pub services: Vec<Uuid>,
    /// Scan window.
    pub timeout: Duration,
}

impl ScanRequest {
    /// Scan for any device for `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            services: Vec::new(),
            timeout,
        }
    }

    /// Scan for the configured GATT service using the configured window.
    pub fn from_config(config: &ProvisionerConfig) -> Self {
        Self::new(config.scan_timeout).with_service(config.gatt.service_uuid)
    }

    /// Add a service of interest.
    pub fn with_service(mut self, service: Uuid) -> Self {
        self.services.push(service);
        self
    }

    /// Replace the scan window.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether `device` is of interest for this request.
    pub fn matches(&self, device: &DiscoveredDevice) -> bool {
        self.services.is_empty() || self.services.iter().any(|s| device.advertises(s))
    }
}

/// [`Scanner`] backed by the shared central session.
#[derive(Clone)]
pub struct BleScanner {
    session: Arc<dyn CentralSession>,
}

impl BleScanner {
    /// Wrap a central session.
    pub fn new(session: Arc<dyn CentralSession>) -> Self {
        Self { session }
    }

    /// The backing session.
    pub fn session(&self) -> &Arc<dyn CentralSession> {
        &self.session
    }

    async fn collect(&self, request: &ScanRequest, first_only: bool) -> Result<Vec<DiscoveredDevice>> {
        // Subscribe before starting so nothing reported at scan start is missed.
        let mut rx = self.session.subscribe_discoveries();
        self.session.start_scan(&request.services).await?;
        let guard = ScanGuard::new(self.session.clone());

        let deadline = tokio::time::Instant::now() + request.timeout;
        let mut found: HashMap<PeerAddress, DiscoveredDevice> = HashMap::new();

        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => break,
                Ok(Ok(device)) => {
                    if !request.matches(&device) {
                        continue;
                    }
                    found.insert(device.address.clone(), device);
                    if first_only {
                        break;
                    }
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!("Scanner lagged, {} discoveries dropped", skipped);
                }
                Ok(Err(RecvError::Closed)) => break,
            }
        }

        guard.release().await?;

        let mut devices: Vec<_> = found.into_values().collect();
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        debug!("Scan finished with {} devices", devices.len());

        Ok(devices)
    }
}

impl std::fmt::Debug for BleScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleScanner").finish_non_exhaustive()
    }
}

#[async_trait]
impl Scanner for BleScanner {
    async fn find_devices(&self, request: &ScanRequest) -> Result<Vec<DiscoveredDevice>> {
        self.collect(request, false).await
    }

    async fn find_first(&self, request: &ScanRequest) -> Result<Option<DiscoveredDevice>> {
        Ok(self.collect(request, true).await?.into_iter().next())
    }

    fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.session.discovered()
    }
}

/// Releases one scan reference, even when the scanning future is dropped.
struct ScanGuard {
    session: Option<Arc<dyn CentralSession>>,
}

impl ScanGuard {
    fn new(session: Arc<dyn CentralSession>) -> Self {
        Self {
            session: Some(session),
        }
    }

    async fn release(mut self) -> Result<()> {
        match self.session.take() {
            Some(session) => session.stop_scan().await,
            None => Ok(()),
        }
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            debug!("Scan cancelled, releasing scan reference");
            runtime.spawn(async move {
                if let Err(e) = session.stop_scan().await {
                    warn!("Error releasing scan: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MockCentralSession;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    fn device(address: &str, service: Option<Uuid>) -> DiscoveredDevice {
        let mut device = DiscoveredDevice::new(address);
        device.services.extend(service);
        device
    }

    /// A mock session that reports `devices` as soon as the scan starts.
    fn reporting_session(devices: Vec<DiscoveredDevice>) -> (MockCentralSession, Arc<AtomicUsize>) {
        let (tx, _) = broadcast::channel(16);
        let subscribe_tx = tx.clone();
        let stops = Arc::new(AtomicUsize::new(0));
        let stop_counter = stops.clone();

        let mut session = MockCentralSession::new();
        session
            .expect_subscribe_discoveries()
            .returning(move || subscribe_tx.subscribe());
        session.expect_start_scan().times(1).returning(move |_| {
            for device in &devices {
                let _ = tx.send(device.clone());
            }
            Ok(())
        });
        session.expect_stop_scan().returning(move || {
            stop_counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        (session, stops)
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_devices_collects_and_deduplicates() {
        let service = Uuid::from_u128(0xFFF6);
        let (session, stops) = reporting_session(vec![
            device("b", Some(service)),
            device("a", Some(service)),
            device("b", Some(service)),
            device("other", None),
        ]);

        let scanner = BleScanner::new(Arc::new(session));
        let request = ScanRequest::new(Duration::from_secs(2)).with_service(service);
        let devices = scanner.find_devices(&request).await.unwrap();

        let addresses: Vec<_> = devices.iter().map(|d| d.address.as_str()).collect();
        assert_eq!(addresses, vec!["a", "b"]);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_first_returns_first_match() {
        let (session, stops) = reporting_session(vec![device("first", None), device("second", None)]);

        let scanner = BleScanner::new(Arc::new(session));
        let found = scanner
            .find_first(&ScanRequest::new(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(found.map(|d| d.address), Some(PeerAddress::from("first")));
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_first_times_out_empty() {
        let (session, stops) = reporting_session(Vec::new());

        let scanner = BleScanner::new(Arc::new(session));
        let found = scanner
            .find_first(&ScanRequest::new(Duration::from_millis(500)))
            .await
            .unwrap();

        assert!(found.is_none());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_scan_error_propagates_without_stop() {
        let mut session = MockCentralSession::new();
        let (tx, _) = broadcast::channel::<DiscoveredDevice>(1);
        session
            .expect_subscribe_discoveries()
            .returning(move || tx.subscribe());
        session
            .expect_start_scan()
            .returning(|_| Err(crate::Error::session_failed("start_scan", "radio off")));
        session.expect_stop_scan().never();

        let scanner = BleScanner::new(Arc::new(session));
        let result = scanner.find_devices(&ScanRequest::new(Duration::from_secs(1))).await;
        assert!(matches!(
            result,
            Err(crate::Error::SessionOperationFailed { .. })
        ));
    }

    #[test]
    fn test_scan_request_from_config() {
        let config = ProvisionerConfig::default();
        let request = ScanRequest::from_config(&config);
        assert_eq!(request.services, vec![config.gatt.service_uuid]);
        assert_eq!(request.timeout, config.scan_timeout);

        assert!(ScanRequest::new(Duration::from_secs(1)).matches(&device("x", None)));
        assert!(!request.matches(&device("x", None)));
    }
}
