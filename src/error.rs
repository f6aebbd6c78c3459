//! Error types for the ble-role-provisioner crate.

use thiserror::Error;

use crate::role::Role;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// The hardware session backing a role could not be created.
    ///
    /// The provisioner leaves the role's slot empty, so a later request
    /// attempts construction again.
    #[error("{role} hardware unavailable: {reason}")]
    HardwareUnavailable {
        /// The role whose session could not be created.
        role: Role,
        /// Description of why construction failed.
        reason: String,
    },

    /// An operation forwarded to a live session failed.
    #[error("Session operation '{operation}' failed: {reason}")]
    SessionOperationFailed {
        /// The session operation that failed.
        operation: String,
        /// Description of the failure reported by the driver.
        reason: String,
    },

    /// A capability was requested after the provisioner was shut down.
    #[error("Role provisioner shut down, {role} capabilities are no longer available")]
    ShutDown {
        /// The role that was requested.
        role: Role,
    },

    /// No peer with this address has been discovered by the session.
    #[error("Peer not found: {address}")]
    PeerNotFound {
        /// The address that was looked up.
        address: String,
    },

    /// The operation requires a connection to the peer.
    #[error("Peer not connected: {address}")]
    NotConnected {
        /// The address of the peer.
        address: String,
    },

    /// Characteristic not found on the peer.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },
}

impl Error {
    /// Build a [`Error::HardwareUnavailable`] for `role`.
    pub fn hardware_unavailable(role: Role, reason: impl std::fmt::Display) -> Self {
        Self::HardwareUnavailable {
            role,
            reason: reason.to_string(),
        }
    }

    /// Build a [`Error::SessionOperationFailed`] from any driver error.
    pub fn session_failed(operation: &str, reason: impl std::fmt::Display) -> Self {
        Self::SessionOperationFailed {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether a later attempt at the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::HardwareUnavailable { .. } | Self::SessionOperationFailed { .. }
        )
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
