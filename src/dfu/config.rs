//! Configuration constants for the legacy Nordic BLE DFU protocol.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

// ============================================================================
// GATT Identifiers
// ============================================================================

/// Legacy DFU service UUID.
pub const DFU_SERVICE_UUID: &str = "00001530-1212-EFDE-1523-785FEABCD123";

/// DFU Control Point characteristic (write, notify).
pub const DFU_CONTROL_POINT_UUID: &str = "00001531-1212-EFDE-1523-785FEABCD123";

/// DFU Packet characteristic (write without response).
pub const DFU_PACKET_UUID: &str = "00001532-1212-EFDE-1523-785FEABCD123";

/// DFU Version characteristic (read). Missing on SDK 6.x bootloaders.
pub const DFU_VERSION_UUID: &str = "00001534-1212-EFDE-1523-785FEABCD123";

// ============================================================================
// Transfer Configuration
// ============================================================================

/// Default data characteristic chunk size (ATT MTU 23 minus 3 bytes of header).
pub const DEFAULT_PACKET_SIZE: usize = 20;

/// Largest chunk a single ATT write can carry.
pub const MAX_PACKET_SIZE: usize = 512;

/// Default Packet Receipt Notification interval.
pub const DEFAULT_PRN_INTERVAL: u16 = 12;

/// Delay before StartDfu on targets without a DFU Version characteristic.
pub const DEFAULT_LEGACY_START_DELAY_MS: u64 = 1000;

/// Number of times an InvalidState answer to StartDfu restarts the session.
pub const DEFAULT_INVALID_STATE_RETRIES: u8 = 1;

/// Flash below this address holds the MBR, which is never part of a .hex image sent.
pub const MBR_SIZE: u32 = 0x1000;

// ============================================================================
// Init Packet
// ============================================================================

/// Minimum size of the extended init packet (SDK 7.0+ bootloaders).
pub const MIN_EXTENDED_INIT_PACKET_SIZE: usize = 14;

/// Size of the init packet accepted by bootloaders without a DFU version (CRC16 only).
pub const LEGACY_INIT_PACKET_SIZE: usize = 2;

// ============================================================================
// Firmware Types
// ============================================================================

/// Firmware component bitmask, as sent in the StartDfu type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FirmwareType(u8);

impl FirmwareType {
    pub const SOFTDEVICE: FirmwareType = FirmwareType(0x01);
    pub const BOOTLOADER: FirmwareType = FirmwareType(0x02);
    pub const APPLICATION: FirmwareType = FirmwareType(0x04);
    pub const SOFTDEVICE_BOOTLOADER: FirmwareType = FirmwareType(0x03);
    pub const ALL: FirmwareType = FirmwareType(0x07);

    /// Build a type from raw bits. Bits outside SD|BL|App are dropped.
    pub const fn from_bits(bits: u8) -> Self {
        FirmwareType(bits & Self::ALL.0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True when every bit of `other` is set in `self`.
    pub const fn contains(self, other: FirmwareType) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Parse a comma-separated list such as `sd,bl,app`.
    pub fn parse_list(list: &str) -> Option<Self> {
        let mut bits = 0u8;
        for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            bits |= match name.to_ascii_lowercase().as_str() {
                "sd" | "softdevice" => Self::SOFTDEVICE.0,
                "bl" | "bootloader" => Self::BOOTLOADER.0,
                "app" | "application" => Self::APPLICATION.0,
                "all" => Self::ALL.0,
                _ => return None,
            };
        }
        if bits == 0 {
            None
        } else {
            Some(FirmwareType(bits))
        }
    }
}

impl Default for FirmwareType {
    fn default() -> Self {
        Self::ALL
    }
}

impl BitOr for FirmwareType {
    type Output = FirmwareType;

    fn bitor(self, rhs: Self) -> Self::Output {
        FirmwareType(self.0 | rhs.0)
    }
}

impl fmt::Display for FirmwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::SOFTDEVICE) {
            names.push("SoftDevice");
        }
        if self.contains(Self::BOOTLOADER) {
            names.push("Bootloader");
        }
        if self.contains(Self::APPLICATION) {
            names.push("Application");
        }
        if names.is_empty() {
            write!(f, "None")
        } else {
            write!(f, "{}", names.join(" + "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firmware_type_bits() {
        assert_eq!(FirmwareType::SOFTDEVICE.bits(), 1);
        assert_eq!(FirmwareType::BOOTLOADER.bits(), 2);
        assert_eq!(FirmwareType::APPLICATION.bits(), 4);
        assert_eq!(
            FirmwareType::SOFTDEVICE | FirmwareType::BOOTLOADER,
            FirmwareType::SOFTDEVICE_BOOTLOADER
        );
        assert_eq!(FirmwareType::from_bits(0xFF), FirmwareType::ALL);
    }

    #[test]
    fn test_firmware_type_contains() {
        assert!(FirmwareType::ALL.contains(FirmwareType::APPLICATION));
        assert!(!FirmwareType::SOFTDEVICE.contains(FirmwareType::SOFTDEVICE_BOOTLOADER));
        assert!(!FirmwareType::from_bits(0).contains(FirmwareType::from_bits(0)));
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(FirmwareType::parse_list("app"), Some(FirmwareType::APPLICATION));
        assert_eq!(
            FirmwareType::parse_list("sd, bl"),
            Some(FirmwareType::SOFTDEVICE_BOOTLOADER)
        );
        assert_eq!(FirmwareType::parse_list("all"), Some(FirmwareType::ALL));
        assert_eq!(FirmwareType::parse_list("modem"), None);
        assert_eq!(FirmwareType::parse_list(""), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(FirmwareType::APPLICATION.to_string(), "Application");
        assert_eq!(
            FirmwareType::SOFTDEVICE_BOOTLOADER.to_string(),
            "SoftDevice + Bootloader"
        );
    }
}
