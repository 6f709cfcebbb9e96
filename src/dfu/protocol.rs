//! Legacy DFU protocol state machine.
//!
//! Sequences one DFU session across one or two connections:
//! 1. Connect - discover the DFU service and read the DFU version
//! 2. Start - enable control point notifications; jump to the bootloader
//!    if the application is running
//! 3. StartDfu - announce the image type and sizes
//! 4. InitPacket - send the init packet of the current part, if any
//! 5. Upload - stream the image under PRN flow control
//! 6. Validate - let the target check the image
//! 7. Activate - ActivateAndReset, then either the next part or done
//!
//! Errors are never reported while the link is open: the first error is
//! kept, the target is reset, and the error is delivered once the
//! disconnection is confirmed. An abort overrides any pending error.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::config::FirmwareType;
use super::controller::DfuController;
use super::device::TargetInfo;
use super::error::{DfuError, DfuFailure, DfuResult};
use super::firmware_reader::FirmwarePackage;
use super::packet::Request;
use super::peripheral::{DfuPeripheral, StreamOutcome};
use super::progress::{DfuProgress, ProgressTracker};
use super::transport::DfuTransport;
use crate::settings::DfuSettings;

/// State of a DFU session as reported to the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DfuState {
    Connecting,
    Starting,
    EnablingDfuMode,
    Uploading,
    Validating,
    Disconnecting,
    Completed,
    Aborted,
}

impl DfuState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DfuState::Completed | DfuState::Aborted)
    }

    pub fn description(self) -> &'static str {
        match self {
            DfuState::Connecting => "Connecting",
            DfuState::Starting => "Starting",
            DfuState::EnablingDfuMode => "Enabling DFU Mode",
            DfuState::Uploading => "Uploading",
            DfuState::Validating => "Validating",
            DfuState::Disconnecting => "Disconnecting",
            DfuState::Completed => "Completed",
            DfuState::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Notification delivered to the session observer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum DfuEvent {
    StateChanged(DfuState),
    Progress(DfuProgress),
    /// Terminal error, delivered after the link closed.
    Error(DfuFailure),
}

/// The single terminal outcome of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DfuOutcome {
    Completed,
    Aborted,
    Failed(DfuFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Connect,
    Start,
    EnableDfuMode,
    StartDfu,
    SendInitPacket,
    Upload,
    Validate,
    Activate,
    Abort,
    Completed,
}

/// Runs one DFU session against a single transport.
pub struct DfuExecutor<T: DfuTransport, F: FnMut(DfuEvent)> {
    peripheral: DfuPeripheral<T>,
    firmware: FirmwarePackage,
    settings: DfuSettings,
    controller: DfuController,
    observer: F,
    invalid_state_retries: u8,
    new_address_expected: bool,
}

impl<T: DfuTransport, F: FnMut(DfuEvent)> DfuExecutor<T, F> {
    pub fn new(transport: T, firmware: FirmwarePackage, settings: DfuSettings, observer: F) -> Self {
        Self {
            peripheral: DfuPeripheral::new(transport, settings.packet_size),
            firmware,
            invalid_state_retries: settings.invalid_state_retries,
            settings,
            controller: DfuController::new(),
            observer,
            new_address_expected: false,
        }
    }

    /// Use an existing controller, e.g. one already handed to a UI.
    pub fn with_controller(mut self, controller: DfuController) -> Self {
        self.controller = controller;
        self
    }

    /// Handle for pausing, resuming and aborting this session.
    pub fn controller(&self) -> DfuController {
        self.controller.clone()
    }

    /// Run the session to its end, blocking the calling thread.
    ///
    /// Exactly one terminal event is delivered: `StateChanged(Completed)`,
    /// `StateChanged(Aborted)` or `Error`.
    pub fn run(mut self) -> DfuOutcome {
        info!(
            "Starting DFU: {} part(s), {} bytes",
            self.firmware.parts(),
            self.firmware.total_size()
        );
        match self.execute() {
            Ok(()) => {
                self.set_state(DfuState::Completed);
                DfuOutcome::Completed
            }
            Err(failure) => self.finish_with_error(failure),
        }
    }

    fn execute(&mut self) -> DfuResult<()> {
        let mut step = Step::Connect;
        loop {
            if self.controller.is_aborted() {
                step = Step::Abort;
            }
            step = match step {
                Step::Connect => self.connect()?,
                Step::Start => self.start()?,
                Step::EnableDfuMode => self.jump_to_bootloader()?,
                Step::StartDfu => self.start_dfu()?,
                Step::SendInitPacket => self.send_init_packet()?,
                Step::Upload => self.upload()?,
                Step::Validate => self.validate()?,
                Step::Activate => self.activate()?,
                Step::Abort => return Err(self.abort_session()),
                Step::Completed => return Ok(()),
            };
        }
    }

    fn set_state(&mut self, state: DfuState) {
        info!("DFU state: {}", state);
        self.controller.set_state(state);
        (self.observer)(DfuEvent::StateChanged(state));
    }

    fn target(&self) -> DfuResult<TargetInfo> {
        self.peripheral
            .target()
            .copied()
            .ok_or_else(|| DfuError::DeviceNotSupported.with_message("Target not identified"))
    }

    // ========================================================================
    // Steps
    // ========================================================================

    fn connect(&mut self) -> DfuResult<Step> {
        self.set_state(DfuState::Connecting);
        let target = self.peripheral.connect()?;

        if self.firmware.current_part().init_packet.is_none()
            && target.is_init_packet_required(self.settings.force_dfu)
        {
            return Err(DfuError::ExtendedInitPacketRequired
                .with_message("The init packet is required by the target device"));
        }
        Ok(Step::Start)
    }

    fn start(&mut self) -> DfuResult<Step> {
        self.set_state(DfuState::Starting);
        self.peripheral.enable_control_point()?;

        let target = self.target()?;
        if target.is_in_application_mode(self.settings.force_dfu) {
            Ok(Step::EnableDfuMode)
        } else {
            Ok(Step::StartDfu)
        }
    }

    fn jump_to_bootloader(&mut self) -> DfuResult<Step> {
        self.set_state(DfuState::EnablingDfuMode);
        let new_address_expected = self.target()?.new_address_expected();

        info!("Switching to bootloader mode");
        self.peripheral.send_command(Request::JumpToBootloader)?;
        self.peripheral.wait_for_disconnect()?;

        if new_address_expected {
            self.peripheral.switch_to_bootloader(true)?;
        }
        Ok(Step::Connect)
    }

    fn start_dfu(&mut self) -> DfuResult<Step> {
        let target = self.target()?;
        self.new_address_expected = target.new_address_expected();

        if target.version.is_none() && self.settings.legacy_start_delay_ms > 0 {
            // SDK 6.x bootloaders answer OperationFailed when StartDfu follows too soon
            std::thread::sleep(Duration::from_millis(self.settings.legacy_start_delay_ms));
        }

        let part = self.firmware.current_part();
        let (kind, size) = (part.kind, part.size);
        let has_init_packet = part.init_packet.is_some();

        info!("Starting DFU for {} ({} bytes)", kind, size.total());
        match self.peripheral.start_dfu(size, Request::StartDfu(kind)) {
            Ok(()) => {}
            Err(failure) if failure.error == DfuError::RemoteNotSupported => {
                if kind != FirmwareType::APPLICATION {
                    return Err(DfuError::RemoteNotSupported
                        .with_message("Updating Softdevice or Bootloader is not supported"));
                }
                info!("DFU target does not support DFU v.2, using StartDfu without type");
                self.peripheral.start_dfu_v1(size)?;
            }
            Err(failure) if failure.error == DfuError::RemoteInvalidState => {
                if self.invalid_state_retries == 0 {
                    return Err(DfuError::RemoteInvalidState.with_message(
                        "Peripheral is in an invalid state, please try to reset and start over again.",
                    ));
                }
                self.invalid_state_retries -= 1;
                warn!("Target reported invalid state, resetting and retrying");
                self.reset_device()?;
                return Ok(Step::Connect);
            }
            Err(failure) => return Err(failure),
        }

        Ok(if has_init_packet {
            Step::SendInitPacket
        } else {
            Step::Upload
        })
    }

    fn send_init_packet(&mut self) -> DfuResult<Step> {
        let init_packet = match &self.firmware.current_part().init_packet {
            Some(data) => data.clone(),
            None => return Ok(Step::Upload),
        };

        match self.peripheral.send_init_packet(&init_packet) {
            Ok(()) => Ok(Step::Upload),
            // A rejected first part (e.g. a bootloader already at that
            // version) may be skipped when an application part follows
            Err(failure) if failure.error.is_remote() && self.firmware.has_next_part() => {
                warn!(
                    "Init packet rejected ({}), continuing with the next part",
                    failure.message
                );
                self.reset_device()?;
                self.advance_to_next_part()
            }
            Err(failure) => Err(failure),
        }
    }

    fn upload(&mut self) -> DfuResult<Step> {
        self.set_state(DfuState::Uploading);

        let prn = self.settings.packet_receipt_notification_parameter;
        if prn > 0 {
            self.peripheral
                .send_command(Request::PacketReceiptNotificationRequest(prn))?;
        }
        self.peripheral.send_command(Request::ReceiveFirmwareImage)?;

        let data = &self.firmware.current_part().data;
        let mut tracker = ProgressTracker::new(
            self.firmware.current_part_number(),
            self.firmware.parts(),
            data.len(),
        );
        let observer = &mut self.observer;
        let outcome = self.peripheral.stream_firmware(
            data,
            prn,
            &self.controller,
            &mut tracker,
            &mut |progress| observer(DfuEvent::Progress(progress)),
        )?;

        Ok(match outcome {
            StreamOutcome::Completed => Step::Validate,
            StreamOutcome::Aborted => Step::Abort,
        })
    }

    fn validate(&mut self) -> DfuResult<Step> {
        self.set_state(DfuState::Validating);
        self.peripheral.send_command(Request::ValidateFirmware)?;
        Ok(Step::Activate)
    }

    fn activate(&mut self) -> DfuResult<Step> {
        self.set_state(DfuState::Disconnecting);
        self.peripheral.send_command(Request::ActivateAndReset)?;
        self.peripheral.wait_for_disconnect()?;

        if self.firmware.has_next_part() {
            return self.advance_to_next_part();
        }
        Ok(Step::Completed)
    }

    fn advance_to_next_part(&mut self) -> DfuResult<Step> {
        self.firmware.advance_to_next_part();
        info!(
            "Sending part {} of {}",
            self.firmware.current_part_number(),
            self.firmware.parts()
        );
        self.peripheral
            .switch_to_bootloader(self.new_address_expected)?;
        Ok(Step::Connect)
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Reset the target, or drop the link if the control point is unusable,
    /// and wait for the disconnection.
    fn reset_device(&mut self) -> DfuResult<()> {
        if !self.peripheral.is_connected() {
            return Ok(());
        }
        if self.peripheral.is_control_point_enabled() {
            self.peripheral.reset()?;
        } else {
            self.peripheral.disconnect()?;
        }
        self.peripheral.wait_for_disconnect()
    }

    /// Best-effort reset used on the error and abort paths.
    fn close_link(&mut self) {
        if let Err(failure) = self.reset_device() {
            warn!("Closing the link failed: {}", failure);
            if self.peripheral.is_connected() {
                self.peripheral.disconnect().ok();
                self.peripheral.mark_disconnected();
            }
        }
    }

    fn abort_session(&mut self) -> DfuFailure {
        info!("Aborting DFU");
        self.close_link();
        DfuError::DeviceDisconnected.with_message("aborted")
    }

    fn finish_with_error(&mut self, failure: DfuFailure) -> DfuOutcome {
        if self.peripheral.is_connected() {
            self.close_link();
        }

        if self.controller.is_aborted() {
            self.set_state(DfuState::Aborted);
            return DfuOutcome::Aborted;
        }

        error!("DFU failed: {}", failure);
        (self.observer)(DfuEvent::Error(failure.clone()));
        DfuOutcome::Failed(failure)
    }
}
