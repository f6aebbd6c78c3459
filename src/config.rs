//! Provisioner configuration.

use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::uuids::{BTP_C1_UUID, BTP_C2_UUID, BTP_C3_UUID, BTP_SERVICE_UUID};

/// GATT layout the hardware sessions serve (peripheral) or expect (central).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GattProfile {
    /// Primary service, also the key for advertised service data.
    pub service_uuid: Uuid,
    /// Characteristic the central writes to.
    pub write_uuid: Uuid,
    /// Characteristic the peripheral notifies or indicates on.
    pub notify_uuid: Uuid,
    /// Read-only characteristic carrying additional advertisement data.
    pub additional_data_uuid: Uuid,
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            service_uuid: BTP_SERVICE_UUID,
            write_uuid: BTP_C1_UUID,
            notify_uuid: BTP_C2_UUID,
            additional_data_uuid: BTP_C3_UUID,
        }
    }
}

/// Configuration shared by the provisioner, its sessions and facades.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProvisionerConfig {
    /// Upper bound on hardware session construction.
    pub session_timeout: Duration,
    /// Advertising interval handed to the peripheral session by broadcasters.
    pub advertising_interval: Duration,
    /// Default scan window for [`ScanRequest`](crate::facade::ScanRequest).
    pub scan_timeout: Duration,
    /// Index into the platform's adapter list for the central session.
    pub adapter_index: usize,
    /// Local name to advertise, if any.
    pub local_name: Option<String>,
    /// GATT layout.
    pub gatt: GattProfile,
}

impl ProvisionerConfig {
    /// Default session construction timeout (10 seconds).
    pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default advertising interval (100 ms).
    pub const DEFAULT_ADVERTISING_INTERVAL: Duration = Duration::from_millis(100);
    /// Default scan window (5 seconds).
    pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session construction timeout.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Set the advertising interval.
    pub fn with_advertising_interval(mut self, interval: Duration) -> Self {
        self.advertising_interval = interval;
        self
    }

    /// Set the default scan window.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Select the adapter used by the central session.
    pub fn with_adapter_index(mut self, index: usize) -> Self {
        self.adapter_index = index;
        self
    }

    /// Set the advertised local name.
    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    /// Replace the GATT profile.
    pub fn with_gatt_profile(mut self, gatt: GattProfile) -> Self {
        self.gatt = gatt;
        self
    }

    /// Check that all durations are usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for a zero timeout or interval.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("session_timeout", self.session_timeout),
            ("advertising_interval", self.advertising_interval),
            ("scan_timeout", self.scan_timeout),
        ];

        for (name, value) in durations {
            if value.is_zero() {
                return Err(Error::InvalidParameter {
                    name: name.to_string(),
                    value: format!("{:?}", value),
                });
            }
        }

        Ok(())
    }
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            session_timeout: Self::DEFAULT_SESSION_TIMEOUT,
            advertising_interval: Self::DEFAULT_ADVERTISING_INTERVAL,
            scan_timeout: Self::DEFAULT_SCAN_TIMEOUT,
            adapter_index: 0,
            local_name: None,
            gatt: GattProfile::default(),
        }
    }
}
