//! DFU settings with persistence.
//!
//! This module provides:
//! - `DfuSettings`, the tunables of a DFU session
//! - Persistence to a JSON file in the app data directory
//!
//! Every field carries `#[serde(default)]` so files written by older
//! versions keep loading.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::dfu::config::{
    FirmwareType, DEFAULT_INVALID_STATE_RETRIES, DEFAULT_LEGACY_START_DELAY_MS,
    DEFAULT_PACKET_SIZE, DEFAULT_PRN_INTERVAL, MAX_PACKET_SIZE,
};

/// Tunables of a DFU session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DfuSettings {
    /// Packets sent between two Packet Receipt Notifications. 0 disables PRNs.
    #[serde(default = "default_prn")]
    pub packet_receipt_notification_parameter: u16,

    /// Assume bootloader mode when the mode cannot be determined from the
    /// DFU Version or the service layout.
    #[serde(default)]
    pub force_dfu: bool,

    /// Components to take from a package.
    #[serde(default)]
    pub firmware_types: FirmwareType,

    /// Size of each write to the DFU Packet characteristic.
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,

    /// Delay before StartDfu on targets without a DFU Version characteristic.
    #[serde(default = "default_legacy_start_delay")]
    pub legacy_start_delay_ms: u64,

    /// Session restarts allowed when StartDfu is answered with Invalid State.
    #[serde(default = "default_invalid_state_retries")]
    pub invalid_state_retries: u8,
}

fn default_prn() -> u16 {
    DEFAULT_PRN_INTERVAL
}

fn default_packet_size() -> usize {
    DEFAULT_PACKET_SIZE
}

fn default_legacy_start_delay() -> u64 {
    DEFAULT_LEGACY_START_DELAY_MS
}

fn default_invalid_state_retries() -> u8 {
    DEFAULT_INVALID_STATE_RETRIES
}

impl Default for DfuSettings {
    fn default() -> Self {
        Self {
            packet_receipt_notification_parameter: DEFAULT_PRN_INTERVAL,
            force_dfu: false,
            firmware_types: FirmwareType::ALL,
            packet_size: DEFAULT_PACKET_SIZE,
            legacy_start_delay_ms: DEFAULT_LEGACY_START_DELAY_MS,
            invalid_state_retries: DEFAULT_INVALID_STATE_RETRIES,
        }
    }
}

impl DfuSettings {
    /// Check values that would make a session impossible.
    pub fn validate(&self) -> Result<(), String> {
        if self.packet_size == 0 || self.packet_size > MAX_PACKET_SIZE {
            return Err(format!(
                "Packet size must be between 1 and {}, got {}",
                MAX_PACKET_SIZE, self.packet_size
            ));
        }
        if self.firmware_types.is_empty() {
            return Err("At least one firmware type must be selected".to_string());
        }
        Ok(())
    }

    /// Check if these settings differ from defaults.
    /// Useful for logging to show when non-default settings are applied.
    pub fn has_non_default_settings(&self) -> bool {
        *self != Self::default()
    }
}

/// Settings file name stored in app data directory.
const SETTINGS_FILENAME: &str = "dfu_settings.json";

/// Manages persistence of DFU settings to JSON file.
pub struct SettingsManager {
    settings_file_path: PathBuf,
}

impl SettingsManager {
    /// Create a new settings manager for the given app data directory.
    pub fn new(app_data_dir: &Path) -> Self {
        let settings_file_path = app_data_dir.join(SETTINGS_FILENAME);
        Self { settings_file_path }
    }

    /// Load settings from disk, returning defaults if file doesn't exist.
    pub fn load(&self) -> Result<DfuSettings, String> {
        if !self.settings_file_path.exists() {
            return Ok(DfuSettings::default());
        }

        let contents = fs::read_to_string(&self.settings_file_path)
            .map_err(|e| format!("Failed to read settings file: {}", e))?;

        // Handle empty file gracefully
        if contents.trim().is_empty() {
            return Ok(DfuSettings::default());
        }

        serde_json::from_str(&contents)
            .map_err(|e| format!("Failed to parse settings JSON: {}", e))
    }

    /// Save settings to disk.
    pub fn save(&self, settings: &DfuSettings) -> Result<(), String> {
        settings.validate()?;

        if let Some(parent) = self.settings_file_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create settings directory: {}", e))?;
        }

        let contents = serde_json::to_string_pretty(settings)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        fs::write(&self.settings_file_path, contents)
            .map_err(|e| format!("Failed to write settings file: {}", e))?;

        Ok(())
    }

    /// Get the path where settings are stored.
    pub fn settings_path(&self) -> &Path {
        &self.settings_file_path
    }
}
