//! Driver for one connected legacy DFU target.
//!
//! Wraps a [`DfuTransport`] and knows how to issue each control point
//! request, wait for the matching notification and stream a firmware image
//! under Packet Receipt Notification flow control.

use tracing::{debug, info, warn};

use super::config::{LEGACY_INIT_PACKET_SIZE, MIN_EXTENDED_INIT_PACKET_SIZE};
use super::controller::DfuController;
use super::device::{DfuVersion, TargetInfo};
use super::error::{DfuError, DfuFailure, DfuResult, TransportError};
use super::firmware_reader::FirmwareSize;
use super::packet::{
    build_image_size_packet_v1, build_image_sizes_packet, to_hex, Completion,
    InitDfuParametersRequest, Notification, OpCode, PacketReceiptNotification, Request,
};
use super::progress::{DfuProgress, ProgressTracker};
use super::transport::{DfuTransport, TransportEvent};

/// How a firmware stream ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Every byte was sent and the target confirmed the upload.
    Completed,
    /// The session was aborted at a window boundary.
    Aborted,
}

// ============================================================================
// PRN Window
// ============================================================================

/// Result of checking a Packet Receipt Notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// The window drained; sending may continue.
    Accepted,
    /// Same value as the previous notification. Ignored.
    Duplicate,
}

/// Bounded window of data packets sent but not yet acknowledged.
#[derive(Debug, Clone)]
pub struct PrnWindow {
    interval: u16,
    in_flight: usize,
    last_received: Option<u32>,
}

impl PrnWindow {
    pub fn new(interval: u16) -> Self {
        Self {
            interval,
            in_flight: 0,
            last_received: None,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn on_packet_sent(&mut self) {
        self.in_flight += 1;
    }

    /// No further packet may be sent until a notification arrives.
    pub fn is_full(&self) -> bool {
        self.interval > 0 && self.in_flight >= self.interval as usize
    }

    /// Check a notification against the number of bytes sent so far.
    ///
    /// Legacy bootloaders are only reliable in the low 16 bits of the
    /// counter, so only those are compared with `bytes_sent`.
    pub fn on_receipt(&mut self, bytes_received: u32, bytes_sent: u32) -> DfuResult<Receipt> {
        if let Some(last) = self.last_received {
            if bytes_received == last {
                return Ok(Receipt::Duplicate);
            }
            if bytes_received < last {
                return Err(DfuError::BytesLost.with_message(format!(
                    "{} bytes reported as received after {} bytes were already confirmed",
                    bytes_received, last
                )));
            }
        }
        if (bytes_sent & 0xFFFF) != (bytes_received & 0xFFFF) {
            return Err(DfuError::BytesLost.with_message(format!(
                "{} bytes were sent while {} bytes were reported as received",
                bytes_sent, bytes_received
            )));
        }
        self.last_received = Some(bytes_received);
        self.in_flight = 0;
        Ok(Receipt::Accepted)
    }
}

// ============================================================================
// Peripheral
// ============================================================================

/// Stateful driver of one DFU target.
pub struct DfuPeripheral<T: DfuTransport> {
    transport: T,
    packet_size: usize,
    connected: bool,
    control_point_enabled: bool,
    target: Option<TargetInfo>,
}

impl<T: DfuTransport> DfuPeripheral<T> {
    pub fn new(transport: T, packet_size: usize) -> Self {
        Self {
            transport,
            packet_size: packet_size.max(1),
            connected: false,
            control_point_enabled: false,
            target: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn target(&self) -> Option<&TargetInfo> {
        self.target.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_control_point_enabled(&self) -> bool {
        self.control_point_enabled
    }

    /// Connect, discover the DFU service and read the DFU version.
    pub fn connect(&mut self) -> DfuResult<TargetInfo> {
        self.control_point_enabled = false;
        self.target = None;

        self.transport
            .connect()
            .map_err(|e| e.into_failure(DfuError::FailedToConnect, "Connecting failed"))?;
        self.connected = true;
        info!("Connected to peripheral");

        let discovery = self.transport.discover_services().map_err(|e| {
            e.into_failure(DfuError::ServiceDiscoveryFailed, "Service discovery failed")
        })?;
        if !discovery.dfu_service || !discovery.control_point {
            return Err(DfuError::DeviceNotSupported
                .with_message("DFU Service or DFU Control Point characteristic not found"));
        }

        let version = if discovery.version {
            let bytes = self.transport.read_version().map_err(|e| {
                e.into_failure(DfuError::ReadingVersionFailed, "Reading DFU Version failed")
            })?;
            let version = DfuVersion::parse(&bytes).ok_or_else(|| {
                DfuError::ReadingVersionFailed.with_message(format!(
                    "Unsupported DFU Version value: {}",
                    to_hex(&bytes)
                ))
            })?;
            info!("DFU Version: {}", version);
            Some(version)
        } else {
            debug!("DFU Version characteristic not found");
            None
        };

        let target = TargetInfo::new(&discovery, version);
        self.target = Some(target);
        Ok(target)
    }

    /// Enable notifications on the DFU Control Point.
    pub fn enable_control_point(&mut self) -> DfuResult<()> {
        self.transport.enable_notifications().map_err(|e| {
            e.into_failure(
                DfuError::EnablingControlPointFailed,
                "Enabling notifications failed",
            )
        })?;
        self.control_point_enabled = true;
        debug!("Notifications enabled for DFU Control Point");
        Ok(())
    }

    /// Point the transport at the bootloader for the next connection.
    pub fn switch_to_bootloader(&mut self, new_address_expected: bool) -> DfuResult<()> {
        self.transport
            .switch_to_bootloader(new_address_expected)
            .map_err(|e| e.into_failure(DfuError::FailedToConnect, "Selecting bootloader failed"))
    }

    /// Write a request and wait until it counts as done.
    pub fn send_command(&mut self, request: Request) -> DfuResult<()> {
        self.write_request(request)?;
        match request.completion() {
            Completion::WriteAck => Ok(()),
            Completion::Response => self.await_response(request),
        }
    }

    /// StartDfu with type byte, followed by the 12-byte size packet.
    pub fn start_dfu(&mut self, size: FirmwareSize, request: Request) -> DfuResult<()> {
        self.write_request(request)?;
        self.write_data(&build_image_sizes_packet(
            size.softdevice,
            size.bootloader,
            size.application,
        ))?;
        self.await_response(request)
    }

    /// StartDfu without type byte, followed by the 4-byte application size.
    pub fn start_dfu_v1(&mut self, size: FirmwareSize) -> DfuResult<()> {
        let request = Request::StartDfuV1;
        self.write_request(request)?;
        self.write_data(&build_image_size_packet_v1(size.application))?;
        self.await_response(request)
    }

    /// Send the init packet in the form the connected target expects.
    pub fn send_init_packet(&mut self, data: &[u8]) -> DfuResult<()> {
        let has_version = self.target.map_or(false, |target| target.version.is_some());
        if has_version {
            if data.len() < MIN_EXTENDED_INIT_PACKET_SIZE {
                return Err(DfuError::ExtendedInitPacketRequired.with_message(format!(
                    "Extended init packet of at least {} bytes required, got {}",
                    MIN_EXTENDED_INIT_PACKET_SIZE,
                    data.len()
                )));
            }
            self.send_command(Request::InitDfuParameters(
                InitDfuParametersRequest::ReceiveInitPacket,
            ))?;
            for chunk in data.chunks(self.packet_size) {
                self.write_data(chunk)?;
            }
            self.send_command(Request::InitDfuParameters(
                InitDfuParametersRequest::InitPacketComplete,
            ))
        } else {
            if data.len() != LEGACY_INIT_PACKET_SIZE {
                return Err(DfuError::InitPacketRequired.with_message(format!(
                    "Init packet with 2-byte CRC required, got {} bytes",
                    data.len()
                )));
            }
            let request = Request::InitDfuParametersV1;
            self.write_request(request)?;
            self.write_data(data)?;
            self.await_response(request)
        }
    }

    /// Stream `firmware` in packet-size chunks.
    ///
    /// With `prn_interval > 0` at most that many packets are in flight; the
    /// next window starts only after the target's notification confirms the
    /// byte count. Pause and abort are honored at window boundaries, or after
    /// every packet when notifications are disabled.
    pub fn stream_firmware(
        &mut self,
        firmware: &[u8],
        prn_interval: u16,
        controller: &DfuController,
        progress: &mut ProgressTracker,
        on_progress: &mut dyn FnMut(DfuProgress),
    ) -> DfuResult<StreamOutcome> {
        let total = firmware.len();
        let mut window = PrnWindow::new(prn_interval);
        let mut sent = 0usize;

        if let Some(p) = progress.update(0) {
            on_progress(p);
        }

        while sent < total {
            let end = (sent + self.packet_size).min(total);
            self.write_data(&firmware[sent..end])?;
            sent = end;
            window.on_packet_sent();

            if let Some(p) = progress.update(sent) {
                on_progress(p);
            }

            // No receipt follows the last packet, only the upload-complete response
            if sent == total {
                break;
            }

            if window.is_full() {
                self.await_packet_receipt(&mut window, sent as u32)?;
            } else if prn_interval > 0 {
                continue;
            }

            if checkpoint(controller) {
                info!("Upload aborted after {} of {} bytes", sent, total);
                return Ok(StreamOutcome::Aborted);
            }
        }

        if total == 0 {
            if let Some(p) = progress.update(0) {
                on_progress(p);
            }
        }

        self.await_upload_complete(&mut window, sent as u32)?;
        info!("Upload completed ({} bytes)", total);
        Ok(StreamOutcome::Completed)
    }

    /// Send Reset. A write error here is expected when the target reboots first.
    pub fn reset(&mut self) -> DfuResult<()> {
        self.send_command(Request::Reset)
    }

    /// Ask the transport to drop the link.
    pub fn disconnect(&mut self) -> DfuResult<()> {
        self.transport
            .disconnect()
            .map_err(|e| e.into_failure(DfuError::DeviceDisconnected, "Disconnecting failed"))
    }

    /// Block until the link closes. Notifications arriving meanwhile are dropped.
    pub fn wait_for_disconnect(&mut self) -> DfuResult<()> {
        loop {
            match self.transport.next_event() {
                Ok(TransportEvent::Disconnected { reason }) => {
                    self.on_disconnected(reason.as_deref());
                    return Ok(());
                }
                Ok(TransportEvent::Notification(bytes)) => {
                    debug!("Ignoring notification while disconnecting: {}", to_hex(&bytes));
                }
                Err(TransportError::Disconnected) | Err(TransportError::NotConnected) => {
                    self.on_disconnected(None);
                    return Ok(());
                }
                Err(e) => {
                    return Err(e.into_failure(
                        DfuError::ReceivingNotificationFailed,
                        "Waiting for disconnection failed",
                    ))
                }
            }
        }
    }

    /// Mark the link as closed without waiting for the transport.
    pub fn mark_disconnected(&mut self) {
        self.on_disconnected(None);
    }

    fn on_disconnected(&mut self, reason: Option<&str>) {
        match reason {
            Some(reason) => info!("Disconnected: {}", reason),
            None => info!("Disconnected"),
        }
        self.connected = false;
        self.control_point_enabled = false;
    }

    fn write_request(&mut self, request: Request) -> DfuResult<()> {
        debug!("Writing to control point: {}", request);
        match self.transport.write_command(&request.encode()) {
            Ok(()) => Ok(()),
            Err(e) if request.resets_target() => {
                // The target may reboot before acknowledging the write
                warn!("{} write reported '{}', treating as sent", request, e);
                Ok(())
            }
            Err(TransportError::Disconnected) => {
                self.on_disconnected(None);
                Err(DfuError::DeviceDisconnected
                    .with_message(format!("Device disconnected while writing {}", request)))
            }
            Err(e) => Err(e.into_failure(
                DfuError::WritingCharacteristicFailed,
                &format!("Writing to characteristic failed: {}", request),
            )),
        }
    }

    fn write_data(&mut self, data: &[u8]) -> DfuResult<()> {
        match self.transport.write_data(data) {
            Ok(()) => Ok(()),
            Err(TransportError::Disconnected) => {
                self.on_disconnected(None);
                Err(DfuError::DeviceDisconnected.with_message("Device disconnected while sending data"))
            }
            Err(e) => Err(e.into_failure(
                DfuError::WritingCharacteristicFailed,
                "Writing to DFU Packet failed",
            )),
        }
    }

    /// Next decoded control point notification.
    fn next_notification(&mut self) -> DfuResult<Notification> {
        match self.transport.next_event() {
            Ok(TransportEvent::Notification(bytes)) => match Notification::decode(&bytes) {
                Some(notification) => {
                    debug!("Notification received: {}", to_hex(&bytes));
                    Ok(notification)
                }
                None => Err(DfuError::UnsupportedResponse
                    .with_message(format!("Unsupported response received: {}", to_hex(&bytes)))),
            },
            Ok(TransportEvent::Disconnected { reason }) => {
                self.on_disconnected(reason.as_deref());
                Err(DfuError::DeviceDisconnected.with_message(match reason {
                    Some(reason) => format!("Device disconnected: {}", reason),
                    None => "Device disconnected unexpectedly".to_string(),
                }))
            }
            Err(TransportError::Disconnected) => {
                self.on_disconnected(None);
                Err(DfuError::DeviceDisconnected.into())
            }
            Err(e) => Err(e.into_failure(
                DfuError::ReceivingNotificationFailed,
                "Receiving notification failed",
            )),
        }
    }

    fn await_response(&mut self, request: Request) -> DfuResult<()> {
        loop {
            match self.next_notification()? {
                Notification::Response(response) if response.request_op_code == request.op_code() => {
                    info!("{} received", response);
                    return check_status(response.status, request);
                }
                Notification::Response(response) => {
                    return Err(DfuError::UnsupportedResponse.with_message(format!(
                        "Unexpected {} while waiting for {}",
                        response, request
                    )));
                }
                Notification::PacketReceipt(prn) => {
                    debug!("Ignoring PRN ({} bytes) while waiting for {}", prn.bytes_received, request);
                }
            }
        }
    }

    fn await_packet_receipt(&mut self, window: &mut PrnWindow, bytes_sent: u32) -> DfuResult<()> {
        loop {
            match self.next_notification()? {
                Notification::PacketReceipt(PacketReceiptNotification { bytes_received }) => {
                    if window.on_receipt(bytes_received, bytes_sent)? == Receipt::Accepted {
                        return Ok(());
                    }
                    debug!("Duplicate PRN ({} bytes) ignored", bytes_received);
                }
                Notification::Response(response)
                    if response.request_op_code == OpCode::ReceiveFirmwareImage =>
                {
                    check_status(response.status, Request::ReceiveFirmwareImage)?;
                    return Err(DfuError::BytesLost.with_message(format!(
                        "Upload reported complete after {} bytes were sent",
                        bytes_sent
                    )));
                }
                Notification::Response(response) => {
                    return Err(DfuError::UnsupportedResponse
                        .with_message(format!("Unexpected {} during upload", response)));
                }
            }
        }
    }

    fn await_upload_complete(&mut self, window: &mut PrnWindow, bytes_sent: u32) -> DfuResult<()> {
        loop {
            match self.next_notification()? {
                Notification::PacketReceipt(PacketReceiptNotification { bytes_received }) => {
                    window.on_receipt(bytes_received, bytes_sent)?;
                }
                Notification::Response(response)
                    if response.request_op_code == OpCode::ReceiveFirmwareImage =>
                {
                    info!("{} received", response);
                    return check_status(response.status, Request::ReceiveFirmwareImage);
                }
                Notification::Response(response) => {
                    return Err(DfuError::UnsupportedResponse
                        .with_message(format!("Unexpected {} during upload", response)));
                }
            }
        }
    }
}

fn check_status(status: super::packet::StatusCode, request: Request) -> DfuResult<()> {
    if status == super::packet::StatusCode::Success {
        return Ok(());
    }
    Err(DfuFailure {
        error: DfuError::from_status(status),
        message: format!("{} failed: {}", request, status.description()),
    })
}

/// Honor pause and abort. Returns true when the session was aborted.
fn checkpoint(controller: &DfuController) -> bool {
    if controller.is_paused() {
        info!("Upload paused");
        let aborted = controller.wait_while_paused();
        if !aborted {
            info!("Upload resumed");
        }
        return aborted;
    }
    controller.is_aborted()
}
