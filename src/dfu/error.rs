//! DFU error types for the legacy Nordic BLE DFU protocol implementation.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use super::config::FirmwareType;
use super::packet::StatusCode;

/// Result type alias for DFU operations.
pub type DfuResult<T> = Result<T, DfuFailure>;

/// Closed taxonomy of errors a DFU session can end with.
///
/// Discriminants below 100 are status codes echoed back by the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize)]
pub enum DfuError {
    #[error("Remote reported success")]
    RemoteSuccess = 1,
    #[error("Remote reported invalid state")]
    RemoteInvalidState = 2,
    #[error("Remote reported operation not supported")]
    RemoteNotSupported = 3,
    #[error("Remote reported data size exceeds limit")]
    RemoteDataExceedsLimit = 4,
    #[error("Remote reported CRC error")]
    RemoteCrcError = 5,
    #[error("Remote reported operation failed")]
    RemoteOperationFailed = 6,

    /// No firmware package was provided.
    #[error("Firmware file not specified")]
    FileNotSpecified = 101,
    /// The firmware package could not be read or is malformed.
    #[error("Firmware file is invalid")]
    FileInvalid = 102,
    /// The target requires an extended init packet (SDK 7.0+).
    #[error("Extended init packet required")]
    ExtendedInitPacketRequired = 103,
    /// The target requires a 2-byte CRC init packet.
    #[error("Init packet required")]
    InitPacketRequired = 104,

    #[error("Failed to connect")]
    FailedToConnect = 201,
    #[error("Device disconnected")]
    DeviceDisconnected = 202,

    #[error("Service discovery failed")]
    ServiceDiscoveryFailed = 301,
    /// The DFU service or one of its characteristics is missing.
    #[error("Device not supported")]
    DeviceNotSupported = 302,
    #[error("Reading DFU version failed")]
    ReadingVersionFailed = 303,
    #[error("Enabling control point notifications failed")]
    EnablingControlPointFailed = 304,
    #[error("Writing characteristic failed")]
    WritingCharacteristicFailed = 305,
    #[error("Receiving notification failed")]
    ReceivingNotificationFailed = 306,
    #[error("Unsupported response received")]
    UnsupportedResponse = 307,
    /// Bytes sent and bytes acknowledged by the target disagree.
    #[error("Bytes lost")]
    BytesLost = 308,
}

impl DfuError {
    /// Numeric code of this error.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// True for status codes echoed by the target.
    pub fn is_remote(self) -> bool {
        self.code() < 100
    }

    /// Map a response status 1:1 onto the remote error range.
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::Success => DfuError::RemoteSuccess,
            StatusCode::InvalidState => DfuError::RemoteInvalidState,
            StatusCode::NotSupported => DfuError::RemoteNotSupported,
            StatusCode::DataSizeExceedsLimit => DfuError::RemoteDataExceedsLimit,
            StatusCode::CrcError => DfuError::RemoteCrcError,
            StatusCode::OperationFailed => DfuError::RemoteOperationFailed,
        }
    }

    /// Get a user-friendly error code for support purposes.
    pub fn error_code(self) -> &'static str {
        match self {
            DfuError::RemoteSuccess => "DFU-001",
            DfuError::RemoteInvalidState => "DFU-002",
            DfuError::RemoteNotSupported => "DFU-003",
            DfuError::RemoteDataExceedsLimit => "DFU-004",
            DfuError::RemoteCrcError => "DFU-005",
            DfuError::RemoteOperationFailed => "DFU-006",
            DfuError::FileNotSpecified => "DFU-101",
            DfuError::FileInvalid => "DFU-102",
            DfuError::ExtendedInitPacketRequired => "DFU-103",
            DfuError::InitPacketRequired => "DFU-104",
            DfuError::FailedToConnect => "DFU-201",
            DfuError::DeviceDisconnected => "DFU-202",
            DfuError::ServiceDiscoveryFailed => "DFU-301",
            DfuError::DeviceNotSupported => "DFU-302",
            DfuError::ReadingVersionFailed => "DFU-303",
            DfuError::EnablingControlPointFailed => "DFU-304",
            DfuError::WritingCharacteristicFailed => "DFU-305",
            DfuError::ReceivingNotificationFailed => "DFU-306",
            DfuError::UnsupportedResponse => "DFU-307",
            DfuError::BytesLost => "DFU-308",
        }
    }

    /// Attach a human-readable message.
    pub fn with_message(self, message: impl Into<String>) -> DfuFailure {
        DfuFailure {
            error: self,
            message: message.into(),
        }
    }
}

/// Terminal error of a DFU session: error kind plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DfuFailure {
    pub error: DfuError,
    pub message: String,
}

impl fmt::Display for DfuFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.error.error_code(), self.message)
    }
}

impl std::error::Error for DfuFailure {}

impl From<DfuError> for DfuFailure {
    fn from(error: DfuError) -> Self {
        DfuFailure {
            error,
            message: error.to_string(),
        }
    }
}

/// Errors raised while loading a firmware package.
#[derive(Debug, Error)]
pub enum FileFormatError {
    /// The archive has no manifest.json.
    #[error("No manifest file found in the archive")]
    NoManifest,

    /// The manifest is malformed or violates the part rules.
    #[error("Invalid manifest: {reason}")]
    InvalidManifest { reason: String },

    /// A file named in the manifest is missing from the archive.
    #[error("File not found in archive: {filename}")]
    FileNotFound { filename: String },

    /// The type filter leaves nothing to send.
    #[error("Specified firmware type not found in the package")]
    TypeNotFound,

    /// A .hex file that cannot be converted.
    #[error("Invalid HEX file, line {line}: {reason}")]
    InvalidHex { line: usize, reason: String },

    #[error("Firmware image is empty")]
    EmptyImage,

    /// A single image must be exactly one of SoftDevice, Bootloader or Application.
    #[error("A single image cannot be sent as {0}")]
    AmbiguousType(FirmwareType),

    /// Not a .zip, .bin, .hex or .dat file where one is expected.
    #[error("Unsupported file: {filename}")]
    UnsupportedFile { filename: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl From<FileFormatError> for DfuFailure {
    fn from(error: FileFormatError) -> Self {
        DfuError::FileInvalid.with_message(error.to_string())
    }
}

/// Errors returned by a [`DfuTransport`](super::transport::DfuTransport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    /// The link dropped while the operation was in flight.
    #[error("Link disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,

    #[error("{0}")]
    Failed(String),
}

impl TransportError {
    /// Map this transport error onto the DFU error of the failed operation.
    pub fn into_failure(self, error: DfuError, context: &str) -> DfuFailure {
        error.with_message(format!("{}: {}", context, self))
    }
}
