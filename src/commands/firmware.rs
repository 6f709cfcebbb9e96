//! Firmware package inspection.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::Path;

use crate::dfu::{DfuFailure, FirmwarePackage, FirmwareSize, FirmwareType};

/// Summary of one part of a firmware package.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwarePartInfo {
    /// 1-based part number, in sending order.
    pub part: usize,
    /// Human-readable components, e.g. "SoftDevice + Bootloader".
    pub kind: String,
    /// StartDfu type byte.
    pub firmware_types: FirmwareType,
    pub size: FirmwareSize,
    pub init_packet_size: Option<usize>,
}

/// Information about a firmware package.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareInfo {
    pub path: String,
    /// SHA-256 of the archive, lowercase hex.
    pub sha256_hash: String,
    pub total_size: u64,
    pub parts: Vec<FirmwarePartInfo>,
}

/// Calculate SHA256 hash of a file
pub fn calculate_sha256(file_path: &Path) -> Result<String, String> {
    let mut file = fs::File::open(file_path)
        .map_err(|e| format!("Failed to open file for hashing: {}", e))?;

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| format!("Failed to read file for hashing: {}", e))?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    let hash = hasher.finalize();
    Ok(format!("{:x}", hash))
}

/// Load a package the same way a DFU session would and describe it.
///
/// `firmware_path` is a distribution .zip, or a .bin/.hex image whose type
/// is given by `types` and whose init packet is `init_packet_path`.
pub fn inspect_firmware_package(
    firmware_path: &Path,
    init_packet_path: Option<&Path>,
    types: FirmwareType,
) -> Result<FirmwareInfo, String> {
    let package = FirmwarePackage::open(firmware_path, init_packet_path, types)
        .map_err(|e| DfuFailure::from(e).to_string())?;

    let parts = package
        .all_parts()
        .iter()
        .enumerate()
        .map(|(index, part)| FirmwarePartInfo {
            part: index + 1,
            kind: part.kind.to_string(),
            firmware_types: part.kind,
            size: part.size,
            init_packet_size: part.init_packet.as_ref().map(Vec::len),
        })
        .collect();

    Ok(FirmwareInfo {
        path: firmware_path.to_string_lossy().to_string(),
        sha256_hash: calculate_sha256(firmware_path)?,
        total_size: package.total_size(),
        parts,
    })
}

/// Validate that a firmware file is a usable DFU package.
pub async fn validate_firmware_package(
    firmware_path: String,
    init_packet_path: Option<String>,
    types: FirmwareType,
) -> Result<FirmwareInfo, String> {
    tokio::task::spawn_blocking(move || {
        inspect_firmware_package(
            Path::new(&firmware_path),
            init_packet_path.as_deref().map(Path::new),
            types,
        )
    })
    .await
    .map_err(|e| format!("Validation failed: {}", e))?
}
