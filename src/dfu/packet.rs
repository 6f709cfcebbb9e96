//! Control point frame encoding for the legacy Nordic BLE DFU protocol.
//!
//! Outbound requests are written to the DFU Control Point characteristic.
//! Inbound notifications on the same characteristic are either a
//! [`Response`] to a request or a [`PacketReceiptNotification`] emitted
//! every N data packets. All multi-byte integers are little-endian.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::config::FirmwareType;

// ============================================================================
// Op Codes
// ============================================================================

/// Control point operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpCode {
    StartDfu = 0x01,
    InitDfuParameters = 0x02,
    ReceiveFirmwareImage = 0x03,
    ValidateFirmware = 0x04,
    ActivateAndReset = 0x05,
    Reset = 0x06,
    /// Defined by the bootloader but never sent by this engine.
    ReportReceivedImageSize = 0x07,
    PacketReceiptNotificationRequest = 0x08,
    ResponseCode = 0x10,
    PacketReceiptNotification = 0x11,
}

impl OpCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(OpCode::StartDfu),
            0x02 => Some(OpCode::InitDfuParameters),
            0x03 => Some(OpCode::ReceiveFirmwareImage),
            0x04 => Some(OpCode::ValidateFirmware),
            0x05 => Some(OpCode::ActivateAndReset),
            0x06 => Some(OpCode::Reset),
            0x07 => Some(OpCode::ReportReceivedImageSize),
            0x08 => Some(OpCode::PacketReceiptNotificationRequest),
            0x10 => Some(OpCode::ResponseCode),
            0x11 => Some(OpCode::PacketReceiptNotification),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Sub-command of InitDfuParameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum InitDfuParametersRequest {
    ReceiveInitPacket = 0x00,
    InitPacketComplete = 0x01,
}

impl InitDfuParametersRequest {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(InitDfuParametersRequest::ReceiveInitPacket),
            0x01 => Some(InitDfuParametersRequest::InitPacketComplete),
            _ => None,
        }
    }
}

// ============================================================================
// Status Codes
// ============================================================================

/// Response status reported by the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StatusCode {
    Success = 0x01,
    InvalidState = 0x02,
    NotSupported = 0x03,
    DataSizeExceedsLimit = 0x04,
    CrcError = 0x05,
    OperationFailed = 0x06,
}

impl StatusCode {
    pub const ALL: [StatusCode; 6] = [
        StatusCode::Success,
        StatusCode::InvalidState,
        StatusCode::NotSupported,
        StatusCode::DataSizeExceedsLimit,
        StatusCode::CrcError,
        StatusCode::OperationFailed,
    ];

    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|status| *status as u8 == byte)
    }

    pub fn description(self) -> &'static str {
        match self {
            StatusCode::Success => "Success",
            StatusCode::InvalidState => "Device is in invalid state",
            StatusCode::NotSupported => "Operation not supported",
            StatusCode::DataSizeExceedsLimit => "Data size exceeds limit",
            StatusCode::CrcError => "CRC Error",
            StatusCode::OperationFailed => "Operation failed",
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// How a request is confirmed once written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Done as soon as the local write is acknowledged.
    WriteAck,
    /// Done when a Response with the matching request op code arrives.
    Response,
}

/// Outbound control point command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Switch an application with buttonless DFU into the bootloader.
    JumpToBootloader,
    StartDfu(FirmwareType),
    /// StartDfu without a type byte (SDK 6.x bootloaders, application only).
    StartDfuV1,
    InitDfuParameters(InitDfuParametersRequest),
    InitDfuParametersV1,
    ReceiveFirmwareImage,
    ValidateFirmware,
    ActivateAndReset,
    Reset,
    PacketReceiptNotificationRequest(u16),
}

impl Request {
    /// Serialize to the control point byte layout.
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Request::JumpToBootloader => {
                vec![OpCode::StartDfu.code(), FirmwareType::APPLICATION.bits()]
            }
            Request::StartDfu(kind) => vec![OpCode::StartDfu.code(), kind.bits()],
            Request::StartDfuV1 => vec![OpCode::StartDfu.code()],
            Request::InitDfuParameters(sub) => {
                vec![OpCode::InitDfuParameters.code(), sub as u8]
            }
            Request::InitDfuParametersV1 => vec![OpCode::InitDfuParameters.code()],
            Request::ReceiveFirmwareImage => vec![OpCode::ReceiveFirmwareImage.code()],
            Request::ValidateFirmware => vec![OpCode::ValidateFirmware.code()],
            Request::ActivateAndReset => vec![OpCode::ActivateAndReset.code()],
            Request::Reset => vec![OpCode::Reset.code()],
            Request::PacketReceiptNotificationRequest(interval) => {
                let [lo, hi] = interval.to_le_bytes();
                vec![OpCode::PacketReceiptNotificationRequest.code(), lo, hi]
            }
        }
    }

    /// Parse an outbound frame back into a request.
    ///
    /// `[0x01, 0x04]` is both JumpToBootloader and StartDfu(Application) on
    /// the wire; it decodes as the latter.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (&first, rest) = bytes.split_first()?;
        match (OpCode::from_byte(first)?, rest) {
            (OpCode::StartDfu, []) => Some(Request::StartDfuV1),
            (OpCode::StartDfu, [kind]) => {
                let kind = FirmwareType::from_bits(*kind);
                if kind.is_empty() {
                    None
                } else {
                    Some(Request::StartDfu(kind))
                }
            }
            (OpCode::InitDfuParameters, []) => Some(Request::InitDfuParametersV1),
            (OpCode::InitDfuParameters, [sub]) => {
                InitDfuParametersRequest::from_byte(*sub).map(Request::InitDfuParameters)
            }
            (OpCode::ReceiveFirmwareImage, []) => Some(Request::ReceiveFirmwareImage),
            (OpCode::ValidateFirmware, []) => Some(Request::ValidateFirmware),
            (OpCode::ActivateAndReset, []) => Some(Request::ActivateAndReset),
            (OpCode::Reset, []) => Some(Request::Reset),
            (OpCode::PacketReceiptNotificationRequest, [lo, hi]) => Some(
                Request::PacketReceiptNotificationRequest(u16::from_le_bytes([*lo, *hi])),
            ),
            _ => None,
        }
    }

    pub fn op_code(&self) -> OpCode {
        match self {
            Request::JumpToBootloader | Request::StartDfu(_) | Request::StartDfuV1 => {
                OpCode::StartDfu
            }
            Request::InitDfuParameters(_) | Request::InitDfuParametersV1 => {
                OpCode::InitDfuParameters
            }
            Request::ReceiveFirmwareImage => OpCode::ReceiveFirmwareImage,
            Request::ValidateFirmware => OpCode::ValidateFirmware,
            Request::ActivateAndReset => OpCode::ActivateAndReset,
            Request::Reset => OpCode::Reset,
            Request::PacketReceiptNotificationRequest(_) => {
                OpCode::PacketReceiptNotificationRequest
            }
        }
    }

    /// When the request counts as done.
    ///
    /// ReceiveFirmwareImage completes on write ack; its Response arrives only
    /// after the whole image has been streamed.
    pub fn completion(&self) -> Completion {
        match self {
            Request::StartDfu(_)
            | Request::StartDfuV1
            | Request::InitDfuParameters(InitDfuParametersRequest::InitPacketComplete)
            | Request::InitDfuParametersV1
            | Request::ValidateFirmware => Completion::Response,
            Request::JumpToBootloader
            | Request::InitDfuParameters(InitDfuParametersRequest::ReceiveInitPacket)
            | Request::ReceiveFirmwareImage
            | Request::ActivateAndReset
            | Request::Reset
            | Request::PacketReceiptNotificationRequest(_) => Completion::WriteAck,
        }
    }

    /// Requests after which the target reboots, possibly before acking the write.
    pub fn resets_target(&self) -> bool {
        matches!(
            self,
            Request::JumpToBootloader | Request::ActivateAndReset | Request::Reset
        )
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::JumpToBootloader => write!(f, "Jump to Bootloader (Op Code = 1, Upload Mode = 4)"),
            Request::StartDfu(kind) => write!(f, "Start DFU (Op Code = 1, Upload Mode = {})", kind.bits()),
            Request::StartDfuV1 => write!(f, "Start DFU (Op Code = 1)"),
            Request::InitDfuParameters(sub) => {
                write!(f, "Initialize DFU Parameters (Op Code = 2, Value = {})", *sub as u8)
            }
            Request::InitDfuParametersV1 => write!(f, "Initialize DFU Parameters (Op Code = 2)"),
            Request::ReceiveFirmwareImage => write!(f, "Receive Firmware Image (Op Code = 3)"),
            Request::ValidateFirmware => write!(f, "Validate Firmware (Op Code = 4)"),
            Request::ActivateAndReset => write!(f, "Activate and Reset (Op Code = 5)"),
            Request::Reset => write!(f, "Reset (Op Code = 6)"),
            Request::PacketReceiptNotificationRequest(n) => {
                write!(f, "Packet Receipt Notif Req (Op Code = 8, Value = {})", n)
            }
        }
    }
}

// ============================================================================
// Inbound Notifications
// ============================================================================

/// Response to a control point request: `[0x10, request op code, status]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub request_op_code: OpCode,
    pub status: StatusCode,
}

impl Response {
    /// Decode a response frame. Returns `None` when the bytes are not one.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 3 || bytes[0] != OpCode::ResponseCode.code() {
            return None;
        }
        Some(Response {
            request_op_code: OpCode::from_byte(bytes[1])?,
            status: StatusCode::from_byte(bytes[2])?,
        })
    }

    pub fn is_success(&self) -> bool {
        self.status == StatusCode::Success
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Response (Op Code = {}, Status = {})",
            self.request_op_code.code(),
            self.status as u8
        )
    }
}

/// Packet Receipt Notification: `[0x11, bytes received as u32 LE]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketReceiptNotification {
    pub bytes_received: u32,
}

impl PacketReceiptNotification {
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 5 || bytes[0] != OpCode::PacketReceiptNotification.code() {
            return None;
        }
        let bytes_received = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        Some(PacketReceiptNotification { bytes_received })
    }
}

/// Any value the target may notify on the control point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    PacketReceipt(PacketReceiptNotification),
    Response(Response),
}

impl Notification {
    /// Try the PRN layout first, then the Response layout.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        PacketReceiptNotification::decode(bytes)
            .map(Notification::PacketReceipt)
            .or_else(|| Response::decode(bytes).map(Notification::Response))
    }
}

// ============================================================================
// Data Characteristic Payloads
// ============================================================================

/// Image size payload written to the packet characteristic after StartDfu.
pub fn build_image_sizes_packet(softdevice: u32, bootloader: u32, application: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(&softdevice.to_le_bytes());
    data.extend_from_slice(&bootloader.to_le_bytes());
    data.extend_from_slice(&application.to_le_bytes());
    data
}

/// Image size payload written after StartDfu without a type byte.
pub fn build_image_size_packet_v1(application: u32) -> Vec<u8> {
    application.to_le_bytes().to_vec()
}

/// Format bytes as `0x..` hex for logging.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for byte in bytes {
        out.push_str(&format!("{:02X}", byte));
    }
    out
}
