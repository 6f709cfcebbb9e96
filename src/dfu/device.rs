//! Target identification for legacy DFU peripherals.
//!
//! Decides from service discovery and the DFU Version characteristic whether
//! the peripheral runs the application (and must first jump to the
//! bootloader) or the bootloader itself, and which init packet it expects.

use std::fmt;

use serde::Serialize;

use super::transport::ServiceDiscovery;

/// Value of the DFU Version characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DfuVersion {
    pub major: u8,
    pub minor: u8,
}

impl DfuVersion {
    /// Parse the 2-byte `[minor, major]` characteristic value.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [minor, major] => Some(DfuVersion {
                major: *major,
                minor: *minor,
            }),
            _ => None,
        }
    }

    /// Version 0.1 is reported by applications with buttonless DFU.
    pub fn is_application(&self) -> bool {
        self.major == 0 && self.minor == 1
    }
}

impl fmt::Display for DfuVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Identified DFU target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TargetInfo {
    /// DFU version, or `None` for SDK 6.x bootloaders without the characteristic.
    pub version: Option<DfuVersion>,
    pub service_count: usize,
    pub has_packet_characteristic: bool,
}

impl TargetInfo {
    pub fn new(discovery: &ServiceDiscovery, version: Option<DfuVersion>) -> Self {
        Self {
            version,
            service_count: discovery.service_count,
            has_packet_characteristic: discovery.packet,
        }
    }

    /// Whether the peripheral is running the application.
    ///
    /// `force_dfu` decides the case where neither the version nor the
    /// service layout tells.
    pub fn is_in_application_mode(&self, force_dfu: bool) -> bool {
        if let Some(version) = self.version {
            return version.is_application();
        }
        if !self.has_packet_characteristic {
            return true;
        }
        // A bootloader exposes only the DFU service
        if self.service_count == 1 {
            return false;
        }
        !force_dfu
    }

    /// SDK 7.0+ bootloaders validate an extended init packet.
    pub fn is_init_packet_required(&self, force_dfu: bool) -> bool {
        self.version.is_some() && !self.is_in_application_mode(force_dfu)
    }

    /// SDK 6.x bootloaders advertise with the application address + 1.
    pub fn new_address_expected(&self) -> bool {
        self.version.is_none()
    }
}
