//! Async commands for DFU (Device Firmware Update) operations.
//!
//! The DFU engine blocks its thread for the whole session, so these commands
//! run it on tokio's blocking pool and forward its events through a channel.

use serde::Serialize;
use std::sync::mpsc;
use std::thread;
use tracing::info;

use crate::dfu::{
    DfuController, DfuEvent, DfuExecutor, DfuFailure, DfuOutcome, DfuState, DfuTransport,
    FirmwarePackage,
};
use crate::settings::DfuSettings;

/// Progress event delivered to the caller during DFU.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DfuProgressEvent {
    /// Current stage name.
    pub stage: String,
    /// Part being uploaded (for uploading stage).
    pub part: Option<usize>,
    /// Number of parts (for uploading stage).
    pub total_parts: Option<usize>,
    /// Upload progress of the current part (0-100).
    pub percent: Option<u8>,
    /// Average upload speed (for uploading stage).
    pub avg_speed_bytes_per_second: Option<f64>,
    /// Support code, e.g. "DFU-005" (for error stage).
    pub error_code: Option<&'static str>,
    /// Human-readable message.
    pub message: String,
}

fn stage_name(state: DfuState) -> &'static str {
    match state {
        DfuState::Connecting => "connecting",
        DfuState::Starting => "starting",
        DfuState::EnablingDfuMode => "bootloader",
        DfuState::Uploading => "uploading",
        DfuState::Validating => "validating",
        DfuState::Disconnecting => "disconnecting",
        DfuState::Completed => "complete",
        DfuState::Aborted => "aborted",
    }
}

impl From<DfuEvent> for DfuProgressEvent {
    fn from(event: DfuEvent) -> Self {
        let empty = Self {
            stage: String::new(),
            part: None,
            total_parts: None,
            percent: None,
            avg_speed_bytes_per_second: None,
            error_code: None,
            message: String::new(),
        };

        match event {
            DfuEvent::StateChanged(state) => Self {
                stage: stage_name(state).to_string(),
                percent: (state == DfuState::Completed).then_some(100),
                message: state.description().to_string(),
                ..empty
            },
            DfuEvent::Progress(progress) => Self {
                stage: "uploading".to_string(),
                part: Some(progress.part),
                total_parts: Some(progress.total_parts),
                percent: Some(progress.percent),
                avg_speed_bytes_per_second: Some(progress.avg_speed_bytes_per_second),
                message: format!(
                    "Uploading part {}/{}: {}%",
                    progress.part, progress.total_parts, progress.percent
                ),
                ..empty
            },
            DfuEvent::Error(failure) => Self {
                stage: "error".to_string(),
                error_code: Some(failure.error.error_code()),
                message: failure.message,
                ..empty
            },
        }
    }
}

/// Flash a firmware package to a device via DFU.
///
/// # Arguments
/// * `transport` - Connection to the target peripheral
/// * `firmware_path` - Path to the distribution .zip file
/// * `settings` - Session settings
/// * `controller` - Handle the caller keeps to pause, resume or abort
/// * `on_event` - Receives progress updates on a dedicated thread
pub async fn flash_dfu_firmware<T, F>(
    transport: T,
    firmware_path: String,
    settings: DfuSettings,
    controller: DfuController,
    on_event: F,
) -> Result<(), String>
where
    T: DfuTransport + 'static,
    F: FnMut(DfuProgressEvent) + Send + 'static,
{
    settings.validate()?;
    if settings.has_non_default_settings() {
        info!("Using non-default DFU settings: {:?}", settings);
    }

    // Create a channel for progress updates from the blocking thread
    let (tx, rx) = mpsc::channel::<DfuEvent>();

    let progress_task = thread::spawn(move || {
        let mut on_event = on_event;
        while let Ok(event) = rx.recv() {
            on_event(DfuProgressEvent::from(event));
        }
    });

    // Run DFU in a blocking task
    let result = tokio::task::spawn_blocking(move || {
        let firmware = match FirmwarePackage::load(&firmware_path, settings.firmware_types) {
            Ok(firmware) => firmware,
            Err(e) => {
                let failure = DfuFailure::from(e);
                let _ = tx.send(DfuEvent::Error(failure.clone()));
                return DfuOutcome::Failed(failure);
            }
        };

        DfuExecutor::new(transport, firmware, settings, move |event| {
            let _ = tx.send(event);
        })
        .with_controller(controller)
        .run()
    })
    .await
    .map_err(|e| format!("DFU task panicked: {}", e))?;

    // Wait for progress forwarding to complete
    let _ = progress_task.join();

    match result {
        DfuOutcome::Completed => Ok(()),
        DfuOutcome::Aborted => Err("DFU aborted".to_string()),
        DfuOutcome::Failed(failure) => Err(failure.to_string()),
    }
}
