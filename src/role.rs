//! The two transport roles a local device can play.

/// A BLE transport role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Role {
    /// Advertiser and GATT server.
    Peripheral,
    /// Scanner and GATT client.
    Central,
}

impl Role {
    /// Check if this is the peripheral role.
    pub fn is_peripheral(&self) -> bool {
        matches!(self, Self::Peripheral)
    }

    /// Check if this is the central role.
    pub fn is_central(&self) -> bool {
        matches!(self, Self::Central)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Peripheral => write!(f, "Peripheral"),
            Self::Central => write!(f, "Central"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_predicates() {
        assert!(Role::Peripheral.is_peripheral());
        assert!(!Role::Peripheral.is_central());
        assert!(Role::Central.is_central());
    }

    #[test]
    fn test_role_display() {
        assert_eq!(format!("{}", Role::Peripheral), "Peripheral");
        assert_eq!(format!("{}", Role::Central), "Central");
    }
}
