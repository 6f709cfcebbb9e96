//! Legacy Nordic BLE DFU engine.
//!
//! Updates the SoftDevice, Bootloader and/or Application of nRF5 targets
//! running a legacy (SDK 6-11) DFU bootloader. The Bluetooth stack is
//! supplied by the caller through [`dfu::DfuTransport`].

pub mod commands;
pub mod dfu;
pub mod settings;

#[cfg(test)]
mod test_helpers;
