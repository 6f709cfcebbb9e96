//! Legacy Nordic DFU (Device Firmware Update) over Bluetooth LE.
//!
//! This module implements the legacy (pre-Secure DFU) protocol used by
//! nRF51/nRF52 bootloaders from SDK 6.x through 11, on top of any GATT
//! stack that implements [`DfuTransport`].
//!
//! # Protocol Overview
//!
//! The DFU process consists of:
//! 1. **Connection** - Discover the DFU service and read the DFU version
//! 2. **Bootloader Entry** - Jump from the application if required
//! 3. **Start** - Announce image type and sizes (StartDfu)
//! 4. **Init Transfer** - Send the init packet (*.dat)
//! 5. **Firmware Transfer** - Stream the image under PRN flow control
//! 6. **Validation** - The target validates the image
//! 7. **Activation** - The target applies the image and reboots
//!
//! A package carrying a system part and an application runs steps 1-7
//! twice, once per part.
//!
//! # Example
//!
//! ```ignore
//! use ble_dfu::dfu::{DfuExecutor, FirmwarePackage, FirmwareType};
//! use ble_dfu::settings::DfuSettings;
//!
//! let firmware = FirmwarePackage::load("firmware.zip", FirmwareType::ALL)?;
//! let executor = DfuExecutor::new(transport, firmware, DfuSettings::default(), |event| {
//!     println!("{:?}", event);
//! });
//! let controller = executor.controller();
//! let outcome = executor.run();
//! ```

pub mod config;
mod controller;
mod device;
mod error;
mod firmware_reader;
pub mod hex;
pub mod packet;
mod peripheral;
mod progress;
mod protocol;
mod transport;

// Configuration
pub use config::FirmwareType;

// Errors
pub use error::{DfuError, DfuFailure, DfuResult, FileFormatError, TransportError};

// Firmware reading
pub use firmware_reader::{FirmwarePackage, FirmwarePart, FirmwareSize};

// Transport
#[cfg(test)]
pub use transport::MockDfuTransport;
pub use transport::{DfuTransport, ServiceDiscovery, TransportEvent};

// Target
pub use device::{DfuVersion, TargetInfo};
pub use peripheral::{DfuPeripheral, PrnWindow, Receipt, StreamOutcome};

// Session
pub use controller::DfuController;
pub use progress::{DfuProgress, ProgressTracker};
pub use protocol::{DfuEvent, DfuExecutor, DfuOutcome, DfuState};
