//! In-memory legacy DFU target.
//!
//! Behaves like an SDK 7+ bootloader (or the application exposing the DFU
//! service) at the control point level. Clones share state, so a test can
//! keep a handle for inspection after moving the target into an executor.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::dfu::packet::{InitDfuParametersRequest, OpCode, Request, StatusCode};
use crate::dfu::{
    DfuController, DfuTransport, FirmwareSize, ServiceDiscovery, TransportError, TransportEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Application,
    Bootloader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Idle,
    StartSizes { typed: bool },
    StartSizeV1,
    InitPacket,
    InitPacketV1,
    Firmware,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Queued {
    Notification(Vec<u8>),
    /// PRN covering `packets` data packets.
    Receipt { bytes: u32, packets: usize },
    Disconnected,
}

#[derive(Debug, Clone, Copy)]
struct Override {
    status: StatusCode,
    once: bool,
}

struct State {
    mode: Mode,
    bootloader_version: Option<[u8; 2]>,
    connected: bool,
    refuse_connections: bool,
    supports_typed_start: bool,
    fail_reset_write: bool,
    drop_packet: Option<usize>,
    disconnect_after_packets: Option<usize>,
    overrides: HashMap<OpCode, Override>,
    abort_on: Option<(OpCode, DfuController)>,

    events: VecDeque<Queued>,
    awaiting: Awaiting,
    prn_interval: u16,
    expected_size: u32,
    packets_since_receipt: usize,
    image_packets: usize,
    written: u32,
    in_flight: usize,

    requests: Vec<Vec<u8>>,
    connections: usize,
    switches: usize,
    announced: Vec<FirmwareSize>,
    init_packet: Vec<u8>,
    received: Vec<u8>,
    images: Vec<Vec<u8>>,
    max_in_flight: usize,
}

/// Shared-state simulated DFU target.
#[derive(Clone)]
pub struct SimulatedTarget {
    state: Arc<Mutex<State>>,
}

impl SimulatedTarget {
    fn with(mode: Mode, bootloader_version: Option<[u8; 2]>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                mode,
                bootloader_version,
                connected: false,
                refuse_connections: false,
                supports_typed_start: true,
                fail_reset_write: false,
                drop_packet: None,
                disconnect_after_packets: None,
                overrides: HashMap::new(),
                abort_on: None,
                events: VecDeque::new(),
                awaiting: Awaiting::Idle,
                prn_interval: 0,
                expected_size: 0,
                packets_since_receipt: 0,
                image_packets: 0,
                written: 0,
                in_flight: 0,
                requests: Vec::new(),
                connections: 0,
                switches: 0,
                announced: Vec::new(),
                init_packet: Vec::new(),
                received: Vec::new(),
                images: Vec::new(),
                max_in_flight: 0,
            })),
        }
    }

    /// Bootloader with DFU Version 0.8 and only the DFU service.
    pub fn bootloader() -> Self {
        Self::with(Mode::Bootloader, Some([8, 0]))
    }

    /// SDK 6 bootloader without the DFU Version characteristic.
    pub fn legacy_bootloader() -> Self {
        Self::with(Mode::Bootloader, None)
    }

    /// Application exposing DFU Version 0.1; jumps to a 0.8 bootloader.
    pub fn application() -> Self {
        Self::with(Mode::Application, Some([8, 0]))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn configure(self, f: impl FnOnce(&mut State)) -> Self {
        f(&mut self.lock());
        self
    }

    /// Answer requests with `op_code` using `status`.
    pub fn respond(self, op_code: OpCode, status: StatusCode) -> Self {
        self.configure(|s| {
            s.overrides.insert(op_code, Override { status, once: false });
        })
    }

    /// Answer the next request with `op_code` using `status`.
    pub fn respond_once(self, op_code: OpCode, status: StatusCode) -> Self {
        self.configure(|s| {
            s.overrides.insert(op_code, Override { status, once: true });
        })
    }

    /// Answer StartDfu with a type byte with NotSupported.
    pub fn without_typed_start(self) -> Self {
        self.configure(|s| s.supports_typed_start = false)
    }

    /// Discard the bytes of the firmware data packet at `index`.
    pub fn drop_packet(self, index: usize) -> Self {
        self.configure(|s| s.drop_packet = Some(index))
    }

    /// Drop the link after `count` firmware data packets.
    pub fn disconnect_after_packets(self, count: usize) -> Self {
        self.configure(|s| s.disconnect_after_packets = Some(count))
    }

    pub fn refuse_connections(self) -> Self {
        self.configure(|s| s.refuse_connections = true)
    }

    /// Reboot on Reset but fail the write.
    pub fn fail_reset_write(self) -> Self {
        self.configure(|s| s.fail_reset_write = true)
    }

    /// Abort `controller` when a request with `op_code` is written.
    pub fn abort_on(self, op_code: OpCode, controller: DfuController) -> Self {
        self.configure(|s| s.abort_on = Some((op_code, controller)))
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Every control point write, in order.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.lock().requests.clone()
    }

    pub fn connections(&self) -> usize {
        self.lock().connections
    }

    pub fn switches_to_bootloader(&self) -> usize {
        self.lock().switches
    }

    pub fn announced_size(&self) -> Option<FirmwareSize> {
        self.lock().announced.last().copied()
    }

    pub fn announced_sizes(&self) -> Vec<FirmwareSize> {
        self.lock().announced.clone()
    }

    /// Last init packet received.
    pub fn init_packet(&self) -> Vec<u8> {
        self.lock().init_packet.clone()
    }

    /// Firmware bytes kept for the current image.
    pub fn received(&self) -> Vec<u8> {
        self.lock().received.clone()
    }

    /// Images that were received completely.
    pub fn images(&self) -> Vec<Vec<u8>> {
        self.lock().images.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }
}

impl State {
    fn status_for(&mut self, op_code: OpCode) -> StatusCode {
        match self.overrides.get(&op_code).copied() {
            Some(Override { status, once }) => {
                if once {
                    self.overrides.remove(&op_code);
                }
                status
            }
            None => StatusCode::Success,
        }
    }

    fn respond(&mut self, op_code: OpCode, status: StatusCode) {
        self.events.push_back(Queued::Notification(vec![
            OpCode::ResponseCode.code(),
            op_code.code(),
            status as u8,
        ]));
    }

    fn drop_link(&mut self) {
        self.connected = false;
        self.awaiting = Awaiting::Idle;
        self.events.push_back(Queued::Disconnected);
    }

    fn on_request(&mut self, request: Request) {
        match request {
            Request::StartDfu(kind) if self.mode == Mode::Application => {
                if kind.bits() == 4 {
                    self.mode = Mode::Bootloader;
                    self.drop_link();
                }
            }
            Request::StartDfu(_) => self.awaiting = Awaiting::StartSizes { typed: true },
            Request::StartDfuV1 => self.awaiting = Awaiting::StartSizeV1,
            Request::JumpToBootloader => {}
            Request::InitDfuParameters(InitDfuParametersRequest::ReceiveInitPacket) => {
                self.init_packet.clear();
                self.awaiting = Awaiting::InitPacket;
            }
            Request::InitDfuParameters(InitDfuParametersRequest::InitPacketComplete) => {
                self.awaiting = Awaiting::Idle;
                let status = self.status_for(OpCode::InitDfuParameters);
                self.respond(OpCode::InitDfuParameters, status);
            }
            Request::InitDfuParametersV1 => {
                self.init_packet.clear();
                self.awaiting = Awaiting::InitPacketV1;
            }
            Request::PacketReceiptNotificationRequest(interval) => self.prn_interval = interval,
            Request::ReceiveFirmwareImage => {
                self.awaiting = Awaiting::Firmware;
                self.received.clear();
                self.written = 0;
                self.image_packets = 0;
                self.packets_since_receipt = 0;
                self.in_flight = 0;
                if self.expected_size == 0 {
                    self.finish_image();
                }
            }
            Request::ValidateFirmware => {
                let status = self.status_for(OpCode::ValidateFirmware);
                self.respond(OpCode::ValidateFirmware, status);
            }
            Request::ActivateAndReset | Request::Reset => self.drop_link(),
        }
    }

    fn on_data(&mut self, data: &[u8]) {
        match self.awaiting {
            Awaiting::StartSizes { typed } => {
                self.awaiting = Awaiting::Idle;
                if typed && !self.supports_typed_start {
                    self.respond(OpCode::StartDfu, StatusCode::NotSupported);
                    return;
                }
                let word = |i: usize| {
                    data.get(i * 4..i * 4 + 4)
                        .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                };
                self.start_image(FirmwareSize {
                    softdevice: word(0),
                    bootloader: word(1),
                    application: word(2),
                });
            }
            Awaiting::StartSizeV1 => {
                self.awaiting = Awaiting::Idle;
                let application = data
                    .get(0..4)
                    .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
                self.start_image(FirmwareSize {
                    application,
                    ..FirmwareSize::default()
                });
            }
            Awaiting::InitPacket => self.init_packet.extend_from_slice(data),
            Awaiting::InitPacketV1 => {
                self.awaiting = Awaiting::Idle;
                self.init_packet = data.to_vec();
                let status = self.status_for(OpCode::InitDfuParameters);
                self.respond(OpCode::InitDfuParameters, status);
            }
            Awaiting::Firmware => self.on_firmware_packet(data),
            Awaiting::Idle => {}
        }
    }

    fn start_image(&mut self, size: FirmwareSize) {
        self.announced.push(size);
        self.expected_size = size.total();
        let status = self.status_for(OpCode::StartDfu);
        self.respond(OpCode::StartDfu, status);
    }

    fn on_firmware_packet(&mut self, data: &[u8]) {
        let index = self.image_packets;
        self.image_packets += 1;
        self.written += data.len() as u32;
        if self.drop_packet != Some(index) {
            self.received.extend_from_slice(data);
        }

        self.in_flight += 1;
        self.max_in_flight = self.max_in_flight.max(self.in_flight);
        self.packets_since_receipt += 1;

        if self.disconnect_after_packets == Some(self.image_packets) {
            self.drop_link();
            return;
        }

        let last_packet = self.written >= self.expected_size;
        if self.prn_interval > 0
            && !last_packet
            && self.packets_since_receipt >= self.prn_interval as usize
        {
            self.events.push_back(Queued::Receipt {
                bytes: self.received.len() as u32,
                packets: self.packets_since_receipt,
            });
            self.packets_since_receipt = 0;
        }

        if last_packet {
            self.finish_image();
        }
    }

    fn finish_image(&mut self) {
        self.awaiting = Awaiting::Idle;
        let status = if self.received.len() as u32 == self.expected_size {
            self.images.push(self.received.clone());
            StatusCode::Success
        } else {
            StatusCode::OperationFailed
        };
        self.respond(OpCode::ReceiveFirmwareImage, status);
    }
}

impl DfuTransport for SimulatedTarget {
    fn connect(&mut self) -> Result<(), TransportError> {
        let mut s = self.lock();
        if s.refuse_connections {
            return Err(TransportError::Failed("Connection refused".into()));
        }
        s.connected = true;
        s.connections += 1;
        s.events.clear();
        s.awaiting = Awaiting::Idle;
        s.prn_interval = 0;
        Ok(())
    }

    fn discover_services(&mut self) -> Result<ServiceDiscovery, TransportError> {
        let s = self.lock();
        if !s.connected {
            return Err(TransportError::NotConnected);
        }
        Ok(match s.mode {
            Mode::Application => ServiceDiscovery {
                service_count: 3,
                dfu_service: true,
                control_point: true,
                packet: true,
                version: true,
            },
            Mode::Bootloader => ServiceDiscovery {
                service_count: 1,
                dfu_service: true,
                control_point: true,
                packet: true,
                version: s.bootloader_version.is_some(),
            },
        })
    }

    fn read_version(&mut self) -> Result<Vec<u8>, TransportError> {
        let s = self.lock();
        match (s.mode, s.bootloader_version) {
            (Mode::Application, _) => Ok(vec![1, 0]),
            (Mode::Bootloader, Some(version)) => Ok(version.to_vec()),
            (Mode::Bootloader, None) => Err(TransportError::Failed("Characteristic not found".into())),
        }
    }

    fn enable_notifications(&mut self) -> Result<(), TransportError> {
        if self.lock().connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn write_command(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let abort = {
            let mut s = self.lock();
            if !s.connected {
                return Err(TransportError::Disconnected);
            }
            s.requests.push(data.to_vec());
            let request = Request::decode(data)
                .ok_or_else(|| TransportError::Failed("Unknown request".into()))?;
            s.on_request(request);

            if request == Request::Reset && s.fail_reset_write {
                return Err(TransportError::Failed("GATT error".into()));
            }
            match &s.abort_on {
                Some((op_code, controller)) if *op_code == request.op_code() => {
                    Some(controller.clone())
                }
                _ => None,
            }
        };
        if let Some(controller) = abort {
            controller.abort();
        }
        Ok(())
    }

    fn write_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut s = self.lock();
        if !s.connected {
            return Err(TransportError::Disconnected);
        }
        s.on_data(data);
        Ok(())
    }

    fn next_event(&mut self) -> Result<TransportEvent, TransportError> {
        let mut s = self.lock();
        match s.events.pop_front() {
            Some(Queued::Notification(bytes)) => Ok(TransportEvent::Notification(bytes)),
            Some(Queued::Receipt { bytes, packets }) => {
                s.in_flight = s.in_flight.saturating_sub(packets);
                let mut value = vec![OpCode::PacketReceiptNotification.code()];
                value.extend_from_slice(&bytes.to_le_bytes());
                Ok(TransportEvent::Notification(value))
            }
            Some(Queued::Disconnected) => Ok(TransportEvent::Disconnected { reason: None }),
            None => Err(TransportError::Timeout),
        }
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut s = self.lock();
        if s.connected {
            s.drop_link();
        }
        Ok(())
    }

    fn switch_to_bootloader(&mut self, _new_address_expected: bool) -> Result<(), TransportError> {
        let mut s = self.lock();
        s.switches += 1;
        s.mode = Mode::Bootloader;
        Ok(())
    }
}
