//! Role provisioning.
//!
//! [`RoleProvisioner`] backs each transport role with exactly one hardware
//! session. The session is created on the first request for any capability
//! of its role and shared by every facade handed out afterwards.

use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::ProvisionerConfig;
use crate::error::{Error, Result};
use crate::facade::{BleBroadcaster, BleScanner, CentralNetworkInterface, PeripheralTransport};
use crate::role::Role;
use crate::session::{
    CentralSession, CentralSessionFactory, HardwareCentralFactory, HardwarePeripheralFactory,
    PeripheralSession, PeripheralSessionFactory,
};

/// Lazily creates and shares the peripheral and central hardware sessions.
///
/// Share one provisioner per transport stack, typically as
/// `Arc<RoleProvisioner>`. Once a role's session exists it is never replaced.
/// A failed creation leaves the role empty, so the next request tries again.
///
/// Sessions are only released by [`RoleProvisioner::shutdown`].
pub struct RoleProvisioner {
    config: ProvisionerConfig,
    peripheral_factory: Arc<dyn PeripheralSessionFactory>,
    central_factory: Arc<dyn CentralSessionFactory>,
    peripheral: OnceCell<Arc<dyn PeripheralSession>>,
    central: OnceCell<Arc<dyn CentralSession>>,
    is_shut_down: AtomicBool,
}

impl RoleProvisioner {
    /// Create a provisioner on the platform's native BLE stack.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if `config` does not validate.
    pub fn new(config: ProvisionerConfig) -> Result<Self> {
        Self::with_factories(
            config,
            Arc::new(HardwarePeripheralFactory),
            Arc::new(HardwareCentralFactory),
        )
    }

    /// Create a provisioner with custom session factories.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if `config` does not validate.
    pub fn with_factories(
        config: ProvisionerConfig,
        peripheral_factory: Arc<dyn PeripheralSessionFactory>,
        central_factory: Arc<dyn CentralSessionFactory>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            peripheral_factory,
            central_factory,
            peripheral: OnceCell::new(),
            central: OnceCell::new(),
            is_shut_down: AtomicBool::new(false),
        })
    }

    /// The provisioner's configuration.
    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    /// Get a transport interface over the peripheral session, creating the
    /// session if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HardwareUnavailable`] if the session cannot be
    /// created, or [`Error::ShutDown`] after [`shutdown`](Self::shutdown).
    pub async fn transport_interface(&self) -> Result<PeripheralTransport> {
        let session = self.peripheral_session().await?;
        Ok(PeripheralTransport::new(session))
    }

    /// Get a broadcaster over the peripheral session, creating the session
    /// if needed. Every announcement carries `additional_advertisement_data`.
    ///
    /// # Errors
    ///
    /// Same as [`transport_interface`](Self::transport_interface).
    pub async fn broadcaster(
        &self,
        additional_advertisement_data: Option<Bytes>,
    ) -> Result<BleBroadcaster> {
        let session = self.peripheral_session().await?;
        Ok(BleBroadcaster::new(
            session,
            additional_advertisement_data,
            &self.config,
        ))
    }

    /// Get a network interface over the central session, creating the session
    /// if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HardwareUnavailable`] if the session cannot be
    /// created, or [`Error::ShutDown`] after [`shutdown`](Self::shutdown).
    pub async fn network_interface(&self) -> Result<CentralNetworkInterface> {
        let session = self.central_session().await?;
        Ok(CentralNetworkInterface::new(session))
    }

    /// Get a scanner over the central session, creating the session if
    /// needed.
    ///
    /// # Errors
    ///
    /// Same as [`network_interface`](Self::network_interface).
    pub async fn scanner(&self) -> Result<BleScanner> {
        let session = self.central_session().await?;
        Ok(BleScanner::new(session))
    }

    /// Check if the peripheral session has been created.
    pub fn has_peripheral_session(&self) -> bool {
        self.peripheral.initialized()
    }

    /// Check if the central session has been created.
    pub fn has_central_session(&self) -> bool {
        self.central.initialized()
    }

    /// Check if [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down.load(Ordering::SeqCst)
    }

    /// Close every session created so far and refuse further capability
    /// requests.
    ///
    /// Facades already handed out stay valid objects, but their operations
    /// fail once their session is closed. Close errors are logged, not
    /// returned.
    pub async fn shutdown(&self) -> Result<()> {
        if self.is_shut_down.swap(true, Ordering::SeqCst) {
            debug!("Role provisioner already shut down");
            return Ok(());
        }

        info!("Shutting down role provisioner");

        if let Some(session) = self.peripheral.get() {
            if let Err(e) = session.close().await {
                warn!("Error closing peripheral session: {}", e);
            }
        }

        if let Some(session) = self.central.get() {
            if let Err(e) = session.close().await {
                warn!("Error closing central session: {}", e);
            }
        }

        Ok(())
    }

    async fn peripheral_session(&self) -> Result<Arc<dyn PeripheralSession>> {
        let factory = &self.peripheral_factory;
        let session = self
            .create_or_reuse(Role::Peripheral, &self.peripheral, || {
                factory.create(&self.config)
            })
            .await?;

        // Shutdown ran while this session was being created.
        if self.is_shut_down() {
            if let Err(e) = session.close().await {
                warn!("Error closing {} session: {}", Role::Peripheral, e);
            }
            return Err(Error::ShutDown {
                role: Role::Peripheral,
            });
        }

        Ok(session)
    }

    async fn central_session(&self) -> Result<Arc<dyn CentralSession>> {
        let factory = &self.central_factory;
        let session = self
            .create_or_reuse(Role::Central, &self.central, || factory.create(&self.config))
            .await?;

        if self.is_shut_down() {
            if let Err(e) = session.close().await {
                warn!("Error closing {} session: {}", Role::Central, e);
            }
            return Err(Error::ShutDown {
                role: Role::Central,
            });
        }

        Ok(session)
    }

    /// Return the session in `slot`, creating it with `create` if empty.
    ///
    /// The check-and-create is serialized by the cell: concurrent callers
    /// wait for one creation, and a failed creation leaves the cell empty.
    async fn create_or_reuse<S, F, Fut>(
        &self,
        role: Role,
        slot: &OnceCell<Arc<S>>,
        create: F,
    ) -> Result<Arc<S>>
    where
        S: ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<S>>>,
    {
        if self.is_shut_down() {
            return Err(Error::ShutDown { role });
        }

        if let Some(session) = slot.get() {
            debug!("Reusing {} session", role);
            return Ok(session.clone());
        }

        let timeout = self.config.session_timeout;
        let session = slot
            .get_or_try_init(|| async move {
                info!("Creating {} session", role);
                match tokio::time::timeout(timeout, create()).await {
                    Ok(Ok(session)) => {
                        info!("{} session created", role);
                        Ok(session)
                    }
                    Ok(Err(e)) => {
                        warn!("{} session creation failed: {}", role, e);
                        Err(as_hardware_unavailable(role, e))
                    }
                    Err(_) => {
                        warn!("{} session creation timed out", role);
                        Err(Error::hardware_unavailable(
                            role,
                            format!("session creation timed out after {:?}", timeout),
                        ))
                    }
                }
            })
            .await?;

        Ok(session.clone())
    }
}

/// Report any construction failure as [`Error::HardwareUnavailable`] for `role`.
fn as_hardware_unavailable(role: Role, error: Error) -> Error {
    match error {
        Error::HardwareUnavailable { role: r, reason } if r == role => {
            Error::HardwareUnavailable { role, reason }
        }
        other => Error::hardware_unavailable(role, other),
    }
}

impl std::fmt::Debug for RoleProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleProvisioner")
            .field("config", &self.config)
            .field("has_peripheral_session", &self.has_peripheral_session())
            .field("has_central_session", &self.has_central_session())
            .field("is_shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::{Broadcaster, TransportInterface};
    use crate::session::loopback::{LoopbackCentralFactory, LoopbackPeripheralFactory};
    use crate::session::is_same_session;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Fixture {
        provisioner: Arc<RoleProvisioner>,
        peripheral: Arc<LoopbackPeripheralFactory>,
        central: Arc<LoopbackCentralFactory>,
    }

    fn fixture_with(
        config: ProvisionerConfig,
        peripheral: LoopbackPeripheralFactory,
        central: LoopbackCentralFactory,
    ) -> Fixture {
        let peripheral = Arc::new(peripheral);
        let central = Arc::new(central);
        let provisioner =
            RoleProvisioner::with_factories(config, peripheral.clone(), central.clone()).unwrap();

        Fixture {
            provisioner: Arc::new(provisioner),
            peripheral,
            central,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            ProvisionerConfig::default(),
            LoopbackPeripheralFactory::new(),
            LoopbackCentralFactory::new(),
        )
    }

    #[tokio::test]
    async fn test_no_session_until_requested() {
        let f = fixture();
        assert!(!f.provisioner.has_peripheral_session());
        assert!(!f.provisioner.has_central_session());

        f.provisioner.scanner().await.unwrap();

        assert!(f.provisioner.has_central_session());
        assert!(!f.provisioner.has_peripheral_session());
        assert_eq!(f.peripheral.attempts(), 0);
        assert_eq!(f.central.created(), 1);
    }

    #[tokio::test]
    async fn test_scanner_twice_reuses_central_session() {
        let f = fixture();
        let first = f.provisioner.scanner().await.unwrap();
        let second = f.provisioner.scanner().await.unwrap();

        assert_eq!(f.central.created(), 1);
        assert!(is_same_session(first.session(), second.session()));
        assert!(is_same_session(first.session(), &f.central.sessions()[0]));
    }

    #[tokio::test]
    async fn test_network_interface_and_scanner_share_session() {
        let f = fixture();
        let network = f.provisioner.network_interface().await.unwrap();
        let scanner = f.provisioner.scanner().await.unwrap();

        assert_eq!(f.central.created(), 1);
        assert!(is_same_session(network.session(), scanner.session()));
    }

    #[tokio::test]
    async fn test_broadcaster_then_transport_share_session() {
        let f = fixture();
        let broadcaster = f
            .provisioner
            .broadcaster(Some(Bytes::from_static(&[0x01, 0x02])))
            .await
            .unwrap();
        let transport = f.provisioner.transport_interface().await.unwrap();

        assert_eq!(f.peripheral.created(), 1);
        assert_eq!(
            broadcaster.additional_advertisement_data(),
            Some(&[0x01, 0x02][..])
        );
        assert!(is_same_session(broadcaster.session(), transport.session()));
        assert!(!f.provisioner.has_central_session());
    }

    #[tokio::test]
    async fn test_failed_creation_is_not_cached() {
        let f = fixture();
        f.peripheral.fail_next(1);

        match f.provisioner.transport_interface().await {
            Err(Error::HardwareUnavailable { role, .. }) => assert_eq!(role, Role::Peripheral),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert!(!f.provisioner.has_peripheral_session());

        let transport = f.provisioner.transport_interface().await.unwrap();
        assert_eq!(f.peripheral.attempts(), 2);
        assert_eq!(f.peripheral.created(), 1);
        assert!(is_same_session(transport.session(), &f.peripheral.sessions()[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_creation_timeout_leaves_slot_empty() {
        let f = fixture_with(
            ProvisionerConfig::default().with_session_timeout(Duration::from_millis(10)),
            LoopbackPeripheralFactory::new(),
            LoopbackCentralFactory::new().with_delay(Duration::from_millis(50)),
        );

        match f.provisioner.network_interface().await {
            Err(Error::HardwareUnavailable { role, reason }) => {
                assert_eq!(role, Role::Central);
                assert!(reason.contains("timed out"), "reason: {}", reason);
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }

        assert!(!f.provisioner.has_central_session());
        assert_eq!(f.central.attempts(), 1);
        assert_eq!(f.central.created(), 0);
    }

    struct BrokenFactory;

    #[async_trait]
    impl PeripheralSessionFactory for BrokenFactory {
        async fn create(&self, _config: &ProvisionerConfig) -> Result<Arc<dyn PeripheralSession>> {
            Err(Error::session_failed("open", "permission denied"))
        }
    }

    #[tokio::test]
    async fn test_factory_errors_surface_as_hardware_unavailable() {
        let provisioner = RoleProvisioner::with_factories(
            ProvisionerConfig::default(),
            Arc::new(BrokenFactory),
            Arc::new(LoopbackCentralFactory::new()),
        )
        .unwrap();

        match provisioner.broadcaster(None).await {
            Err(Error::HardwareUnavailable { role, reason }) => {
                assert_eq!(role, Role::Peripheral);
                assert!(reason.contains("permission denied"), "reason: {}", reason);
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_calls_create_one_session() {
        let f = fixture_with(
            ProvisionerConfig::default(),
            LoopbackPeripheralFactory::new().with_delay(Duration::from_millis(20)),
            LoopbackCentralFactory::new(),
        );

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let provisioner = f.provisioner.clone();
                tokio::spawn(async move { provisioner.transport_interface().await })
            })
            .collect();

        let mut transports = Vec::new();
        for task in tasks {
            transports.push(task.await.unwrap().unwrap());
        }

        assert_eq!(f.peripheral.created(), 1);
        assert_eq!(f.peripheral.attempts(), 1);
        let session = f.peripheral.sessions()[0].clone();
        assert!(transports
            .iter()
            .all(|t| is_same_session(t.session(), &session)));
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions_and_refuses_requests() {
        let f = fixture();
        let transport = f.provisioner.transport_interface().await.unwrap();
        f.provisioner.scanner().await.unwrap();

        f.provisioner.shutdown().await.unwrap();
        f.provisioner.shutdown().await.unwrap();

        assert!(f.provisioner.is_shut_down());
        assert_eq!(f.peripheral.sessions()[0].close_calls(), 1);
        assert_eq!(f.central.sessions()[0].close_calls(), 1);

        // Slots are never cleared.
        assert!(f.provisioner.has_peripheral_session());
        assert!(f.provisioner.has_central_session());

        assert!(matches!(
            f.provisioner.broadcaster(None).await,
            Err(Error::ShutDown {
                role: Role::Peripheral
            })
        ));
        assert!(matches!(
            f.provisioner.network_interface().await,
            Err(Error::ShutDown { role: Role::Central })
        ));

        // Facades outlive shutdown but their session refuses work.
        assert!(matches!(
            transport.send(&[1]).await,
            Err(Error::SessionOperationFailed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_finished_after_shutdown_is_closed_by_creator() {
        let f = fixture_with(
            ProvisionerConfig::default(),
            LoopbackPeripheralFactory::new().with_delay(Duration::from_millis(50)),
            LoopbackCentralFactory::new(),
        );

        let provisioner = f.provisioner.clone();
        let pending = tokio::spawn(async move { provisioner.transport_interface().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        f.provisioner.shutdown().await.unwrap();

        assert!(matches!(
            pending.await.unwrap(),
            Err(Error::ShutDown {
                role: Role::Peripheral
            })
        ));
        assert_eq!(f.peripheral.created(), 1);
        assert!(f.peripheral.sessions()[0].is_closed());
        assert_eq!(f.peripheral.sessions()[0].close_calls(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_any_session() {
        let f = fixture();
        f.provisioner.shutdown().await.unwrap();

        assert!(matches!(
            f.provisioner.scanner().await,
            Err(Error::ShutDown { role: Role::Central })
        ));
        assert_eq!(f.central.attempts(), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = RoleProvisioner::with_factories(
            ProvisionerConfig::default().with_session_timeout(Duration::ZERO),
            Arc::new(LoopbackPeripheralFactory::new()),
            Arc::new(LoopbackCentralFactory::new()),
        );
        assert!(matches!(result, Err(Error::InvalidParameter { .. })));
    }

    #[test]
    fn test_as_hardware_unavailable_keeps_matching_role() {
        let kept = as_hardware_unavailable(
            Role::Central,
            Error::hardware_unavailable(Role::Central, "no adapter"),
        );
        assert_eq!(kept.to_string(), "Central hardware unavailable: no adapter");

        let wrapped = as_hardware_unavailable(Role::Central, Error::session_failed("open", "busy"));
        assert!(matches!(
            wrapped,
            Error::HardwareUnavailable {
                role: Role::Central,
                ..
            }
        ));
    }
}
