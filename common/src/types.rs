//! Common Types for the LTE Receiver
//!
//! Defines fundamental identity types used throughout the receiver stack.

use serde::{Deserialize, Serialize};

/// Physical Cell Identity (0-503)
///
/// Composed of the cell identity group `N_id_1` (0-167, "secondary id") and
/// the identity within the group `N_id_2` (0-2, "group id"):
/// `PCI = 3 * N_id_1 + N_id_2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pci(pub u16);

impl Pci {
    /// Maximum valid PCI value (0-503)
    pub const MAX: u16 = 503;

    /// Create a new PCI with validation
    pub fn new(value: u16) -> Option<Self> {
        if value <= Self::MAX {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Compose a PCI from its two identity components
    pub fn from_ids(n_id_1: u16, n_id_2: u8) -> Option<Self> {
        if n_id_1 < 168 && n_id_2 < 3 {
            Some(Self(3 * n_id_1 + n_id_2 as u16))
        } else {
            None
        }
    }

    /// Get the PCI value
    pub fn value(&self) -> u16 {
        self.0
    }

    /// Cell identity group `N_id_1` (0-167), carried by the SSS
    pub fn n_id_1(&self) -> u16 {
        self.0 / 3
    }

    /// Identity within the group `N_id_2` (0-2), carried by the PSS
    pub fn n_id_2(&self) -> u8 {
        (self.0 % 3) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pci_validation() {
        assert!(Pci::new(0).is_some());
        assert!(Pci::new(503).is_some());
        assert!(Pci::new(504).is_none());
    }

    #[test]
    fn test_pci_components() {
        let pci = Pci::new(269).unwrap();
        assert_eq!(pci.n_id_1(), 89);
        assert_eq!(pci.n_id_2(), 2);
        assert_eq!(Pci::from_ids(89, 2), Some(pci));
    }

    #[test]
    fn test_from_ids_bounds() {
        assert!(Pci::from_ids(167, 2).is_some());
        assert!(Pci::from_ids(168, 0).is_none());
        assert!(Pci::from_ids(0, 3).is_none());
    }
}
