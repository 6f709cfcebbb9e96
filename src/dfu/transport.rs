//! GATT transport abstraction for DFU communication.
//!
//! The engine never talks to a Bluetooth stack directly. A [`DfuTransport`]
//! wraps one peripheral and exposes the legacy DFU service's characteristics
//! plus the connection lifecycle, enabling both real radios and simulated
//! targets in tests.

#[cfg(test)]
use mockall::automock;

use super::error::TransportError;

/// What service discovery found on the connected peripheral.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceDiscovery {
    /// Number of primary services on the peripheral.
    pub service_count: usize,
    /// The legacy DFU service is present.
    pub dfu_service: bool,
    /// DFU Control Point characteristic is present.
    pub control_point: bool,
    /// DFU Packet characteristic is present.
    pub packet: bool,
    /// DFU Version characteristic is present.
    pub version: bool,
}

/// Something the peripheral did while we were waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Value notified on the control point characteristic.
    Notification(Vec<u8>),
    /// The link closed. `reason` is set when the stack reported an error.
    Disconnected { reason: Option<String> },
}

/// Trait for DFU transport operations.
///
/// All calls block until the operation completes locally. Remote confirmation
/// arrives separately through [`DfuTransport::next_event`].
#[cfg_attr(test, automock)]
pub trait DfuTransport: Send {
    /// Connect to the current peripheral.
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Discover services and the DFU characteristics.
    fn discover_services(&mut self) -> Result<ServiceDiscovery, TransportError>;

    /// Read the DFU Version characteristic.
    fn read_version(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Enable notifications on the control point.
    fn enable_notifications(&mut self) -> Result<(), TransportError>;

    /// Write with response to the control point. Returns on the local write ack.
    fn write_command(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Write without response to the packet characteristic.
    fn write_data(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Block until the next notification or disconnection.
    ///
    /// Implementations apply their own timeout and return
    /// [`TransportError::Timeout`] when it expires.
    fn next_event(&mut self) -> Result<TransportEvent, TransportError>;

    /// Request a disconnection. The confirmation arrives as
    /// [`TransportEvent::Disconnected`].
    fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Target the peripheral advertising the bootloader for the next connect.
    ///
    /// `new_address_expected` is set when the bootloader advertises with an
    /// address one higher than the application did.
    fn switch_to_bootloader(&mut self, new_address_expected: bool) -> Result<(), TransportError>;
}

impl<T: DfuTransport + ?Sized> DfuTransport for Box<T> {
    fn connect(&mut self) -> Result<(), TransportError> {
        (**self).connect()
    }

    fn discover_services(&mut self) -> Result<ServiceDiscovery, TransportError> {
        (**self).discover_services()
    }

    fn read_version(&mut self) -> Result<Vec<u8>, TransportError> {
        (**self).read_version()
    }

    fn enable_notifications(&mut self) -> Result<(), TransportError> {
        (**self).enable_notifications()
    }

    fn write_command(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write_command(data)
    }

    fn write_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write_data(data)
    }

    fn next_event(&mut self) -> Result<TransportEvent, TransportError> {
        (**self).next_event()
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        (**self).disconnect()
    }

    fn switch_to_bootloader(&mut self, new_address_expected: bool) -> Result<(), TransportError> {
        (**self).switch_to_bootloader(new_address_expected)
    }
}
