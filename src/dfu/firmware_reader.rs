//! Firmware package reader for legacy Nordic DFU.
//!
//! Reads a distribution ZIP containing:
//! - manifest.json - which files belong to which firmware component
//! - *.bin - firmware images
//! - *.dat - init packets (optional)
//!
//! A single .bin or Intel .hex image with an optional .dat init packet is
//! accepted too, sent as one part of an explicit type.
//!
//! A package holds one or two parts. When a system part (SoftDevice and/or
//! Bootloader) and an Application are both present, the system part is sent
//! first and the Application over a second connection.

use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::config::{FirmwareType, MBR_SIZE};
use super::error::FileFormatError;
use super::hex::hex_to_bin;

const MANIFEST_FILE: &str = "manifest.json";

/// Image sizes announced to the bootloader in the StartDfu size packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareSize {
    pub softdevice: u32,
    pub bootloader: u32,
    pub application: u32,
}

impl FirmwareSize {
    pub fn total(&self) -> u32 {
        self.softdevice + self.bootloader + self.application
    }
}

/// One part of a package, sent over a single connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePart {
    /// Components carried by this part (StartDfu type byte).
    pub kind: FirmwareType,
    /// Firmware image.
    pub data: Vec<u8>,
    /// Init packet, if the package provides one.
    pub init_packet: Option<Vec<u8>>,
    /// Per-component sizes of `data`.
    pub size: FirmwareSize,
}

/// Contents of a firmware distribution package.
#[derive(Debug, Clone)]
pub struct FirmwarePackage {
    parts: Vec<FirmwarePart>,
    current: usize,
}

// ============================================================================
// Manifest
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawManifest {
    manifest: ManifestInner,
}

#[derive(Debug, Deserialize)]
struct ManifestInner {
    application: Option<ManifestEntry>,
    softdevice: Option<ManifestEntry>,
    bootloader: Option<ManifestEntry>,
    #[serde(alias = "softdeviceBootloader")]
    softdevice_bootloader: Option<SoftdeviceBootloaderEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    bin_file: String,
    dat_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SoftdeviceBootloaderEntry {
    bin_file: String,
    dat_file: Option<String>,
    #[serde(alias = "sdSize")]
    sd_size: u32,
    #[serde(alias = "blSize")]
    bl_size: u32,
}

impl ManifestInner {
    fn system_entry_count(&self) -> usize {
        [
            self.softdevice.is_some(),
            self.bootloader.is_some(),
            self.softdevice_bootloader.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }

    fn validate(&self) -> Result<(), FileFormatError> {
        match self.system_entry_count() {
            0 if self.application.is_none() => Err(FileFormatError::InvalidManifest {
                reason: "manifest names no firmware".to_string(),
            }),
            0 | 1 => Ok(()),
            _ => Err(FileFormatError::InvalidManifest {
                reason: "only one of softdevice, bootloader and softdevice_bootloader may be present"
                    .to_string(),
            }),
        }
    }
}

impl FirmwarePackage {
    /// Open a distribution ZIP, or a .bin/.hex image with an optional .dat.
    ///
    /// For a ZIP, `types` filters the parts. For a single image it names
    /// the image's type and must be exactly one component.
    pub fn open(
        path: &Path,
        init_packet_path: Option<&Path>,
        types: FirmwareType,
    ) -> Result<Self, FileFormatError> {
        if let Some(dat) = init_packet_path {
            if extension(dat).as_deref() != Some("dat") {
                return Err(unsupported(dat));
            }
        }

        match (extension(path).as_deref(), init_packet_path) {
            (Some("zip"), None) => Self::load(path, types),
            (Some("zip"), Some(dat)) => Err(unsupported(dat)),
            (Some(kind @ ("bin" | "hex")), dat) => {
                let data = std::fs::read(path)?;
                let init_packet = dat.map(std::fs::read).transpose()?;
                if kind == "bin" {
                    Self::from_bin(data, init_packet, types)
                } else {
                    Self::from_hex(&data, init_packet, types)
                }
            }
            _ => Err(unsupported(path)),
        }
    }

    /// Single-part package from a plain binary image.
    pub fn from_bin(
        data: Vec<u8>,
        init_packet: Option<Vec<u8>>,
        kind: FirmwareType,
    ) -> Result<Self, FileFormatError> {
        match kind {
            FirmwareType::SOFTDEVICE | FirmwareType::BOOTLOADER | FirmwareType::APPLICATION => {}
            other => return Err(FileFormatError::AmbiguousType(other)),
        }

        let size = part_size(kind, image_size(data.len())?);
        Ok(Self {
            parts: vec![FirmwarePart {
                kind,
                data,
                init_packet,
                size,
            }],
            current: 0,
        })
    }

    /// Single-part package from an Intel HEX image. The MBR region is dropped.
    pub fn from_hex(
        hex: &[u8],
        init_packet: Option<Vec<u8>>,
        kind: FirmwareType,
    ) -> Result<Self, FileFormatError> {
        Self::from_bin(hex_to_bin(hex, MBR_SIZE)?, init_packet, kind)
    }

    /// Load a package from a ZIP file, keeping only the types in `types`.
    pub fn load<P: AsRef<Path>>(path: P, types: FirmwareType) -> Result<Self, FileFormatError> {
        let file = File::open(path.as_ref())?;
        Self::from_reader(file, types)
    }

    /// Load a package from any seekable ZIP source.
    pub fn from_reader<R: Read + Seek>(
        reader: R,
        types: FirmwareType,
    ) -> Result<Self, FileFormatError> {
        let mut archive = zip::ZipArchive::new(reader)?;
        let manifest = read_manifest(&mut archive)?;
        manifest.validate()?;

        let mut parts = Vec::with_capacity(2);

        // At most one system entry survives validation
        if let Some(entry) = manifest
            .softdevice_bootloader
            .as_ref()
            .filter(|_| types.contains(FirmwareType::SOFTDEVICE_BOOTLOADER))
        {
            let data = read_file_from_zip(&mut archive, &entry.bin_file)?;
            if entry.sd_size as u64 + entry.bl_size as u64 != data.len() as u64 {
                return Err(FileFormatError::InvalidManifest {
                    reason: format!(
                        "sd_size ({}) + bl_size ({}) does not match {} ({} bytes)",
                        entry.sd_size,
                        entry.bl_size,
                        entry.bin_file,
                        data.len()
                    ),
                });
            }
            parts.push(FirmwarePart {
                kind: FirmwareType::SOFTDEVICE_BOOTLOADER,
                init_packet: read_optional_file(&mut archive, entry.dat_file.as_deref())?,
                size: FirmwareSize {
                    softdevice: entry.sd_size,
                    bootloader: entry.bl_size,
                    application: 0,
                },
                data,
            });
        } else if let Some(entry) = manifest
            .softdevice
            .as_ref()
            .filter(|_| types.contains(FirmwareType::SOFTDEVICE))
        {
            parts.push(read_part(&mut archive, entry, FirmwareType::SOFTDEVICE)?);
        } else if let Some(entry) = manifest
            .bootloader
            .as_ref()
            .filter(|_| types.contains(FirmwareType::BOOTLOADER))
        {
            parts.push(read_part(&mut archive, entry, FirmwareType::BOOTLOADER)?);
        }

        if let Some(entry) = manifest
            .application
            .as_ref()
            .filter(|_| types.contains(FirmwareType::APPLICATION))
        {
            parts.push(read_part(&mut archive, entry, FirmwareType::APPLICATION)?);
        }

        if parts.is_empty() {
            return Err(FileFormatError::TypeNotFound);
        }

        Ok(Self { parts, current: 0 })
    }

    /// Number of parts: 2 when a system part and an Application are both sent.
    pub fn parts(&self) -> usize {
        self.parts.len()
    }

    /// 1-based number of the current part.
    pub fn current_part_number(&self) -> usize {
        self.current + 1
    }

    pub fn current_part(&self) -> &FirmwarePart {
        &self.parts[self.current]
    }

    pub fn has_next_part(&self) -> bool {
        self.current + 1 < self.parts.len()
    }

    /// Move to the Application part. Returns false, changing nothing, if
    /// there is no next part.
    pub fn advance_to_next_part(&mut self) -> bool {
        if !self.has_next_part() {
            return false;
        }
        self.current += 1;
        true
    }

    /// All parts in send order.
    pub fn all_parts(&self) -> &[FirmwarePart] {
        &self.parts
    }

    /// Total bytes across all parts.
    pub fn total_size(&self) -> u64 {
        self.parts.iter().map(|part| part.data.len() as u64).sum()
    }
}

fn read_part<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    entry: &ManifestEntry,
    kind: FirmwareType,
) -> Result<FirmwarePart, FileFormatError> {
    let data = read_file_from_zip(archive, &entry.bin_file)?;
    let init_packet = read_optional_file(archive, entry.dat_file.as_deref())?;
    let size = part_size(kind, image_size(data.len())?);
    Ok(FirmwarePart {
        kind,
        data,
        init_packet,
        size,
    })
}

/// Image length as sent in the 32-bit StartDfu size fields.
fn image_size(len: usize) -> Result<u32, FileFormatError> {
    u32::try_from(len).map_err(|_| FileFormatError::InvalidManifest {
        reason: format!("image of {} bytes exceeds the 4 GiB size field", len),
    })
}

fn part_size(kind: FirmwareType, len: u32) -> FirmwareSize {
    match kind {
        FirmwareType::SOFTDEVICE => FirmwareSize {
            softdevice: len,
            ..FirmwareSize::default()
        },
        FirmwareType::BOOTLOADER => FirmwareSize {
            bootloader: len,
            ..FirmwareSize::default()
        },
        _ => FirmwareSize {
            application: len,
            ..FirmwareSize::default()
        },
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

fn unsupported(path: &Path) -> FileFormatError {
    FileFormatError::UnsupportedFile {
        filename: path.to_string_lossy().to_string(),
    }
}

/// Read and parse the manifest.json from the archive.
fn read_manifest<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> Result<ManifestInner, FileFormatError> {
    let mut manifest_file = archive
        .by_name(MANIFEST_FILE)
        .map_err(|_| FileFormatError::NoManifest)?;

    let mut contents = String::new();
    manifest_file.read_to_string(&mut contents)?;

    let raw: RawManifest =
        serde_json::from_str(&contents).map_err(|e| FileFormatError::InvalidManifest {
            reason: e.to_string(),
        })?;
    Ok(raw.manifest)
}

fn read_optional_file<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: Option<&str>,
) -> Result<Option<Vec<u8>>, FileFormatError> {
    name.map(|name| read_file_from_zip(archive, name)).transpose()
}

/// Read a file from the zip archive by name.
fn read_file_from_zip<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
) -> Result<Vec<u8>, FileFormatError> {
    let mut file = archive
        .by_name(name)
        .map_err(|_| FileFormatError::FileNotFound {
            filename: name.to_string(),
        })?;

    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data)?;

    Ok(data)
}
