//! Hardware access layer for both actuator links.
//!
//! The drivers never talk to `rusb` or `socketcan` directly; they go
//! through [`HardwareDevice`] (discharger side) and [`CanLink`]
//! (charger side). Besides the real hardware, both carry degraded-mode
//! variants: a capture replay and a small simulated battery for the USB
//! link, a recording bus for CAN. The station keeps functioning on a
//! bench with no hardware attached by substituting those variants.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use rusb::{Context, DeviceHandle, Direction, Recipient, RequestType, UsbContext};
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket};

use crate::constants::*;
use crate::error::{Result, StationError};

/// Capability abstraction over the discharger's USB link.
pub enum HardwareDevice {
    /// The EBC-B20H itself, claimed through libusb
    Real(UsbHandle),
    /// Replays raw bulk reads from a capture file
    LogReplay(LogReplayDevice),
    /// Small battery model answering commands with plausible frames
    Simulated(SimulatedDevice),
}

impl HardwareDevice {
    /// Claim the real discharger. Fails with [`StationError::DeviceNotFound`]
    /// when it is not on the bus.
    pub fn open() -> Result<Self> {
        Ok(Self::Real(UsbHandle::open()?))
    }

    /// Replay a capture file (one whitespace-separated decimal byte line
    /// per bulk read).
    pub fn replay<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::LogReplay(LogReplayDevice::load(path)?))
    }

    pub fn simulated() -> Self {
        Self::Simulated(SimulatedDevice::default())
    }

    /// Host-to-device vendor control transfer.
    pub fn control_out(&mut self, request: u8, value: u16, index: u16) -> Result<()> {
        match self {
            Self::Real(dev) => dev.control_out(request, value, index),
            Self::Simulated(sim) => {
                sim.control_transfers += 1;
                Ok(())
            }
            Self::LogReplay(_) => {
                debug!("[ctrl out] req {:#04x} value {:#06x} index {:#06x}", request, value, index);
                Ok(())
            }
        }
    }

    /// Device-to-host vendor control transfer.
    pub fn control_in(&mut self, request: u8, value: u16, index: u16, len: usize) -> Result<Vec<u8>> {
        match self {
            Self::Real(dev) => dev.control_in(request, value, index, len),
            Self::Simulated(sim) => {
                sim.control_transfers += 1;
                Ok(vec![0; len])
            }
            Self::LogReplay(_) => {
                debug!("[ctrl in] req {:#04x} value {:#06x} index {:#06x}", request, value, index);
                Ok(vec![0; len])
            }
        }
    }

    /// Write one command frame to the bulk OUT endpoint.
    pub fn write_bulk(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Real(dev) => dev.write_bulk(data),
            Self::LogReplay(dev) => {
                dev.log_write(data);
                Ok(())
            }
            Self::Simulated(sim) => {
                sim.apply_command(data);
                Ok(())
            }
        }
    }

    /// Read raw bytes from the bulk IN endpoint.
    ///
    /// A timeout is a routine condition and yields an empty buffer.
    pub fn read_bulk(&mut self) -> Result<Vec<u8>> {
        match self {
            Self::Real(dev) => dev.read_bulk(),
            Self::LogReplay(dev) => Ok(dev.next_read()),
            Self::Simulated(sim) => Ok(sim.next_read()),
        }
    }

    /// Release the interface claim and restore the kernel driver if one
    /// was detached at open time.
    pub fn release(&mut self) -> Result<()> {
        match self {
            Self::Real(dev) => dev.release(),
            Self::LogReplay(_) | Self::Simulated(_) => Ok(()),
        }
    }
}

/// Claimed libusb handle to the EBC-B20H.
pub struct UsbHandle {
    handle: DeviceHandle<Context>,
    kernel_driver_detached: bool,
}

impl UsbHandle {
    fn open() -> Result<Self> {
        let context = Context::new()?;
        let handle = context
            .open_device_with_vid_pid(VENDOR_ID, PRODUCT_ID)
            .ok_or(StationError::DeviceNotFound)?;

        // remember whether we displaced the kernel's own driver so
        // release() can hand the interface back
        let kernel_driver_detached = handle.kernel_driver_active(0).unwrap_or(false);
        if kernel_driver_detached {
            handle.detach_kernel_driver(0)?;
        }
        handle.claim_interface(0)?;

        Ok(Self { handle, kernel_driver_detached })
    }

    fn control_out(&self, request: u8, value: u16, index: u16) -> Result<()> {
        let request_type = rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        self.handle.write_control(
            request_type,
            request,
            value,
            index,
            &[],
            Duration::from_millis(WRITE_TIMEOUT_MS),
        )?;
        Ok(())
    }

    fn control_in(&self, request: u8, value: u16, index: u16, len: usize) -> Result<Vec<u8>> {
        let request_type = rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);
        let mut buf = vec![0u8; len];
        let n = self.handle.read_control(
            request_type,
            request,
            value,
            index,
            &mut buf,
            Duration::from_millis(WRITE_TIMEOUT_MS),
        )?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write_bulk(&self, data: &[u8]) -> Result<()> {
        self.handle
            .write_bulk(ENDPOINT_OUT, data, Duration::from_millis(WRITE_TIMEOUT_MS))?;
        Ok(())
    }

    fn read_bulk(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; READ_CHUNK];
        match self
            .handle
            .read_bulk(ENDPOINT_IN, &mut buf, Duration::from_millis(READ_TIMEOUT_MS))
        {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(rusb::Error::Timeout) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn release(&mut self) -> Result<()> {
        self.handle.release_interface(0)?;
        if self.kernel_driver_detached {
            self.handle.attach_kernel_driver(0)?;
        }
        Ok(())
    }
}

/// Replays raw bulk reads from a capture file, one read per line.
pub struct LogReplayDevice {
    lines: Vec<Vec<u8>>,
    cursor: usize,
}

impl LogReplayDevice {
    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut lines = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let bytes = line
                .split_whitespace()
                .map(|tok| {
                    tok.parse::<u8>().map_err(|_| {
                        StationError::Parse(format!("bad byte {:?} on line {}", tok, lineno + 1))
                    })
                })
                .collect::<Result<Vec<u8>>>()?;
            lines.push(bytes);
        }
        Ok(Self { lines, cursor: 0 })
    }

    fn log_write(&self, data: &[u8]) {
        let formatted: Vec<String> = data.iter().map(|b| format!("{:3}", b)).collect();
        debug!("[write] {}", formatted.join(" "));
    }

    fn next_read(&mut self) -> Vec<u8> {
        if self.cursor >= self.lines.len() {
            return Vec::new();
        }
        let line = self.lines[self.cursor].clone();
        self.cursor += 1;
        line
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimMode {
    Idle,
    Charging,
    Discharging,
}

/// Small battery model behind the discharger's wire protocol.
///
/// Commands move it between idle/charging/discharging; every bulk read
/// advances the model by one poll interval and answers with one
/// well-formed telemetry frame in the device's reporting scale.
pub struct SimulatedDevice {
    mode: SimMode,
    voltage: f64,
    current: f64,
    mah: f64,
    set_current: f64,
    cutoff_voltage: f64,
    /// voltage slope per poll while discharging (and rise while charging)
    sag_per_read: f64,
    /// current the virtual external charger pushes in passthrough mode
    charge_current: f64,
    pending_status: Option<u8>,
    writes: Vec<Vec<u8>>,
    pub(crate) control_transfers: usize,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::with_battery(25.2, 0.05)
    }
}

impl SimulatedDevice {
    pub fn with_battery(voltage: f64, sag_per_read: f64) -> Self {
        Self {
            mode: SimMode::Idle,
            voltage,
            current: 0.0,
            mah: 0.0,
            set_current: 0.0,
            cutoff_voltage: MIN_CUTOFF_V,
            sag_per_read,
            charge_current: 2.0,
            pending_status: None,
            writes: Vec::new(),
            control_transfers: 0,
        }
    }

    /// Command frames received so far, oldest first.
    pub fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    /// Inverse of the command encoding (host scale, not reporting scale).
    fn command_value(msb: u8, lsb: u8) -> f64 {
        f64::from(msb) * 2.4 + f64::from(lsb) * 0.01
    }

    fn apply_command(&mut self, frame: &[u8]) {
        self.writes.push(frame.to_vec());
        if frame.len() < 1 + CMD_BODY_LEN || frame[0] != FRAME_START {
            return;
        }
        let body = &frame[1..1 + CMD_BODY_LEN];
        match body[0] {
            CMD_DISCHARGE => {
                self.set_current = Self::command_value(body[1], body[2]);
                self.cutoff_voltage = Self::command_value(body[3], body[4]);
                self.mode = SimMode::Discharging;
                self.current = self.set_current;
                self.mah = 0.0;
            }
            CMD_ADJUST => {
                self.set_current = Self::command_value(body[1], body[2]);
                self.cutoff_voltage = Self::command_value(body[3], body[4]);
                if self.mode == SimMode::Discharging {
                    self.current = self.set_current;
                }
            }
            CMD_CHARGE | CMD_CHARGE_CONT => {
                self.set_current = Self::command_value(body[1], body[2]);
                self.mode = SimMode::Charging;
                self.current = self.charge_current;
            }
            CMD_STOP => {
                self.mode = SimMode::Idle;
                self.current = 0.0;
            }
            _ => {}
        }
    }

    fn step(&mut self) {
        let hours = MONITOR_INTERVAL_MS as f64 / 3_600_000.0;
        match self.mode {
            SimMode::Discharging => {
                self.mah += self.current * 1000.0 * hours;
                self.voltage -= self.sag_per_read;
                if self.voltage <= self.cutoff_voltage {
                    self.voltage = self.cutoff_voltage;
                    self.mode = SimMode::Idle;
                    self.current = 0.0;
                    self.pending_status = Some(STATUS_DISCHARGE_DONE);
                }
            }
            SimMode::Charging => {
                self.mah += self.current * 1000.0 * hours;
                self.voltage += self.sag_per_read;
            }
            SimMode::Idle => {
                self.current = 0.0;
            }
        }
    }

    /// Telemetry-scale pair for a current reading (inverse of decode_current).
    fn report_current(amps: f64) -> (u8, u8) {
        let raw = (amps * 100.0).round() as u16;
        ((raw / 240) as u8, (raw % 240) as u8)
    }

    /// Telemetry-scale pair for a voltage reading, low branch of the
    /// piecewise decode (the model stays well under 30 V).
    fn report_voltage(volts: f64) -> (u8, u8) {
        let raw = (volts * 1000.0).round() as u16;
        ((raw / 240) as u8, (raw % 240) as u8)
    }

    /// Telemetry-scale pair for an accumulated charge reading.
    fn report_mah(mah: f64) -> (u8, u8) {
        let raw = if mah < 10_000.0 {
            mah.round() as u16
        } else {
            32_768 + (mah / 10.0).round() as u16
        };
        ((raw / 240) as u8, (raw % 240) as u8)
    }

    fn next_read(&mut self) -> Vec<u8> {
        self.step();
        let status = self.pending_status.take().unwrap_or(match self.mode {
            SimMode::Idle => STATUS_IDLE,
            SimMode::Charging => STATUS_CHARGING,
            SimMode::Discharging => STATUS_DISCHARGING,
        });

        let mut frame = vec![0u8; FRAME_LEN];
        frame[0] = FRAME_START;
        frame[1] = status;
        let (c_msb, c_lsb) = Self::report_current(self.current);
        frame[2] = c_msb;
        frame[3] = c_lsb;
        let (v_msb, v_lsb) = Self::report_voltage(self.voltage);
        frame[4] = v_msb;
        frame[5] = v_lsb;
        let (m_msb, m_lsb) = Self::report_mah(self.mah);
        frame[6] = m_msb;
        frame[7] = m_lsb;
        let (sc_msb, sc_lsb) = Self::report_current(self.set_current);
        frame[8] = sc_msb;
        frame[9] = sc_lsb;
        let (cv_msb, cv_lsb) = Self::report_voltage(self.cutoff_voltage);
        frame[10] = cv_msb;
        frame[11] = cv_lsb;
        frame[FRAME_LEN - 2] = crate::codec::checksum(&frame[1..FRAME_LEN - 2]);
        frame[FRAME_LEN - 1] = FRAME_END;
        frame
    }
}

/// Capability abstraction over the charger's CAN link.
pub enum CanLink {
    Real(CanSocket),
    Simulated(SimCanBus),
}

impl CanLink {
    pub fn open(interface: &str) -> Result<Self> {
        Ok(Self::Real(CanSocket::open(interface)?))
    }

    pub fn simulated() -> Self {
        Self::Simulated(SimCanBus::new())
    }

    /// Send one extended-ID frame.
    pub fn send(&mut self, id: u32, data: &[u8; 8]) -> Result<()> {
        match self {
            Self::Real(socket) => {
                let id = ExtendedId::new(id)
                    .ok_or_else(|| StationError::Frame(format!("CAN ID {:#x} out of range", id)))?;
                let frame = CanFrame::new(id, data)
                    .ok_or_else(|| StationError::Frame("CAN payload too long".to_string()))?;
                socket.write_frame(&frame)?;
                Ok(())
            }
            Self::Simulated(bus) => {
                bus.record(id, *data);
                Ok(())
            }
        }
    }

    /// Receive one frame; `Ok(None)` when nothing arrived within the
    /// read timeout.
    pub fn recv(&mut self) -> Result<Option<(u32, Vec<u8>)>> {
        match self {
            Self::Real(socket) => match socket.read_frame_timeout(Duration::from_millis(READ_TIMEOUT_MS)) {
                Ok(frame) => {
                    let raw = match frame.id() {
                        Id::Extended(id) => id.as_raw(),
                        Id::Standard(id) => u32::from(id.as_raw()),
                    };
                    Ok(Some((raw, frame.data().to_vec())))
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            },
            Self::Simulated(bus) => Ok(bus.inbound.pop_front()),
        }
    }
}

/// Recording CAN bus double: keeps every transmitted frame and hands
/// out queued inbound frames.
#[derive(Default)]
pub struct SimCanBus {
    sent: Arc<Mutex<Vec<(u32, [u8; 8])>>>,
    inbound: VecDeque<(u32, Vec<u8>)>,
}

impl SimCanBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the transmit log, usable after the bus has been
    /// handed to a driver.
    pub fn transmit_log(&self) -> Arc<Mutex<Vec<(u32, [u8; 8])>>> {
        Arc::clone(&self.sent)
    }

    /// Queue a frame for the next `recv`.
    pub fn push_inbound(&mut self, id: u32, data: Vec<u8>) {
        self.inbound.push_back((id, data));
    }

    fn record(&mut self, id: u32, data: [u8; 8]) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((id, data));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    #[test]
    fn simulated_device_answers_valid_frames() {
        let mut sim = SimulatedDevice::default();
        let frame = sim.next_read();
        assert!(codec::is_frame_valid(&frame));
        let data = codec::decode_frame(&frame);
        assert_eq!(data.status, STATUS_IDLE);
        assert_eq!(data.current, 0.0);
        assert!((data.voltage - 25.2).abs() < 0.01);
    }

    #[test]
    fn simulated_discharge_runs_down_to_cutoff() {
        let mut sim = SimulatedDevice::with_battery(25.2, 0.2);
        sim.apply_command(&codec::frame_command(&[CMD_DISCHARGE, 0, 200, 10, 40, 0, 0]));
        assert_eq!(sim.mode, SimMode::Discharging);
        assert!((sim.set_current - 2.0).abs() < 1e-9);
        assert!((sim.cutoff_voltage - 24.4).abs() < 1e-9);

        let mut saw_done = false;
        for _ in 0..10 {
            let frame = sim.next_read();
            assert!(codec::is_frame_valid(&frame));
            if codec::decode_frame(&frame).status == STATUS_DISCHARGE_DONE {
                saw_done = true;
                break;
            }
        }
        assert!(saw_done);
        assert!(sim.mah > 0.0);

        // settled at idle afterwards
        let frame = sim.next_read();
        assert_eq!(codec::decode_frame(&frame).status, STATUS_IDLE);
    }

    #[test]
    fn simulated_stop_returns_to_idle() {
        let mut sim = SimulatedDevice::default();
        sim.apply_command(&codec::frame_command(&[CMD_CHARGE, 0, 10, 0, 0, 0, 0]));
        assert_eq!(codec::decode_frame(&sim.next_read()).status, STATUS_CHARGING);
        sim.apply_command(&codec::frame_command(&[CMD_STOP, 0, 0, 0, 0, 0, 0]));
        assert_eq!(codec::decode_frame(&sim.next_read()).status, STATUS_IDLE);
        assert_eq!(sim.writes().len(), 2);
    }

    #[test]
    fn replay_device_parses_capture_lines() {
        let dir = std::env::temp_dir().join("battest-replay-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("capture.txt");
        std::fs::write(&path, "250 10 0 50\n\n0 0 248\n").unwrap();

        let mut dev = LogReplayDevice::load(&path).unwrap();
        assert_eq!(dev.next_read(), vec![250, 10, 0, 50]);
        assert_eq!(dev.next_read(), vec![0, 0, 248]);
        // exhausted capture behaves like a quiet link
        assert!(dev.next_read().is_empty());
    }

    #[test]
    fn replay_device_rejects_garbage() {
        let dir = std::env::temp_dir().join("battest-replay-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("garbage.txt");
        std::fs::write(&path, "250 x 0\n").unwrap();
        assert!(LogReplayDevice::load(&path).is_err());
    }

    #[test]
    fn sim_bus_records_transmissions() {
        let bus = SimCanBus::new();
        let log = bus.transmit_log();
        let mut link = CanLink::Simulated(bus);
        link.send(CHARGER_SETPOINT_ID, &[1, 2, 3, 4, 0, 0, 0, 0]).unwrap();
        let sent = log.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, CHARGER_SETPOINT_ID);
    }
}
