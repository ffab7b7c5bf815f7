//! Driver for the ZKETECH EBC-B20H electronic-load discharger.
//!
//! The driver owns the USB link through [`HardwareDevice`], replays the
//! captured connect handshake, issues the discharge / passthrough-charge /
//! adjust / stop commands, and runs a background poll loop that turns
//! the raw byte stream into live telemetry and charging/discharging
//! status flags.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::codec::{self, FrameReader};
use crate::constants::*;
use crate::error::{Result, StationError};
use crate::hardware::HardwareDevice;

/// Called once per valid decoded frame with `(voltage, current, mah)`.
pub type TelemetryCallback = Box<dyn Fn(f64, f64, f64) + Send + 'static>;

/// Live link state shared with the poll loop.
#[derive(Debug, Default, Clone, Copy)]
struct Session {
    is_charging: bool,
    is_discharging: bool,
    voltage: f64,
    current: f64,
    mah: f64,
}

pub struct EbcB20h {
    device: Arc<Mutex<HardwareDevice>>,
    session: Arc<Mutex<Session>>,
    callback: Arc<Mutex<Option<TelemetryCallback>>>,
    running: Arc<AtomicBool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl EbcB20h {
    /// Claim the discharger on the USB bus.
    ///
    /// Fails with [`StationError::DeviceNotFound`] when it is absent;
    /// the owning layer is expected to fall back to
    /// [`HardwareDevice::simulated`] via [`EbcB20h::with_device`].
    pub fn open() -> Result<Self> {
        Ok(Self::with_device(HardwareDevice::open()?))
    }

    pub fn with_device(device: HardwareDevice) -> Self {
        Self {
            device: Arc::new(Mutex::new(device)),
            session: Arc::new(Mutex::new(Session::default())),
            callback: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            monitor: Mutex::new(None),
        }
    }

    /// Replay the captured vendor handshake, then send the connect command.
    pub fn connect(&self) -> Result<()> {
        let mut device = self.device.lock().unwrap();
        for step in CONNECT_HANDSHAKE {
            match step.read_len {
                Some(len) => {
                    device.control_in(step.request, step.value, step.index, len as usize)?;
                }
                None => device.control_out(step.request, step.value, step.index)?,
            }
        }
        device.write_bulk(&codec::frame_command(&[CMD_CONNECT, 0, 0, 0, 0, 0, 0]))?;
        info!("discharger connected");
        Ok(())
    }

    pub fn disconnect(&self) -> Result<()> {
        self.send_command([CMD_DISCONNECT, 0, 0, 0, 0, 0, 0])?;
        info!("discharger disconnected");
        Ok(())
    }

    /// Start a discharge. Inputs are clamped to the device limits.
    pub fn discharge(&self, current: f64, cutoff_voltage: f64) -> Result<()> {
        let current = current.clamp(MIN_CURRENT_A, MAX_CURRENT_A);
        let cutoff = cutoff_voltage.clamp(MIN_CUTOFF_V, MAX_CUTOFF_V);
        let (c_msb, c_lsb) = codec::encode_current(current);
        let (v_msb, v_lsb) = codec::encode_voltage(cutoff);
        self.send_command([CMD_DISCHARGE, c_msb, c_lsb, v_msb, v_lsb, 0, 0])?;

        let mut session = self.session.lock().unwrap();
        session.is_discharging = true;
        session.is_charging = false;
        info!("discharging at {:.1} A down to {:.2} V", current, cutoff);
        Ok(())
    }

    /// Enter passthrough charge monitoring: the discharger merely
    /// watches and limits while the external charger supplies power.
    pub fn charge(&self, cutoff_current: f64) -> Result<()> {
        let cutoff = cutoff_current.clamp(MIN_CURRENT_A, MAX_CURRENT_A);
        let (c_msb, c_lsb) = codec::encode_current(cutoff);
        let continuing = self.session.lock().unwrap().is_charging;
        let command = if continuing { CMD_CHARGE_CONT } else { CMD_CHARGE };
        self.send_command([command, c_msb, c_lsb, 0, 0, 0, 0])?;

        let mut session = self.session.lock().unwrap();
        session.is_charging = true;
        session.is_discharging = false;
        info!("passthrough charge monitoring, cutoff {:.1} A", cutoff);
        Ok(())
    }

    /// Modify an in-flight discharge without restarting it; the status
    /// flags are left untouched.
    pub fn adjust(&self, current: f64, cutoff_voltage: f64) -> Result<()> {
        let current = current.clamp(MIN_CURRENT_A, MAX_CURRENT_A);
        let cutoff = cutoff_voltage.clamp(MIN_CUTOFF_V, MAX_CUTOFF_V);
        let (c_msb, c_lsb) = codec::encode_current(current);
        let (v_msb, v_lsb) = codec::encode_voltage(cutoff);
        self.send_command([CMD_ADJUST, c_msb, c_lsb, v_msb, v_lsb, 0, 0])?;
        info!("adjusted discharge to {:.1} A / {:.2} V", current, cutoff);
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.send_command([CMD_STOP, 0, 0, 0, 0, 0, 0])?;
        let mut session = self.session.lock().unwrap();
        session.is_charging = false;
        session.is_discharging = false;
        info!("discharger stopped");
        Ok(())
    }

    /// Zero the session telemetry before a fresh measurement.
    pub fn clear(&self) {
        let mut session = self.session.lock().unwrap();
        session.voltage = 0.0;
        session.current = 0.0;
        session.mah = 0.0;
    }

    /// Register the telemetry consumer, replacing any previous one.
    pub fn subscribe(&self, callback: impl Fn(f64, f64, f64) + Send + 'static) {
        *self.callback.lock().unwrap() = Some(Box::new(callback));
    }

    pub fn is_charging(&self) -> bool {
        self.session.lock().unwrap().is_charging
    }

    pub fn is_discharging(&self) -> bool {
        self.session.lock().unwrap().is_discharging
    }

    pub fn voltage(&self) -> f64 {
        self.session.lock().unwrap().voltage
    }

    pub fn current(&self) -> f64 {
        self.session.lock().unwrap().current
    }

    pub fn mah(&self) -> f64 {
        self.session.lock().unwrap().mah
    }

    pub fn is_monitoring(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn send_command(&self, body: [u8; CMD_BODY_LEN]) -> Result<()> {
        self.device.lock().unwrap().write_bulk(&codec::frame_command(&body))
    }

    /// One poll cycle: read the link, split into candidates, decode the
    /// valid ones into the session and the telemetry callback. Invalid
    /// frames are expected noise on the USB link and dropped without
    /// comment; a read timeout is just an empty read.
    fn poll_cycle(
        device: &Mutex<HardwareDevice>,
        session: &Mutex<Session>,
        callback: &Mutex<Option<TelemetryCallback>>,
        reader: &mut FrameReader,
    ) {
        let data = match device.lock().unwrap().read_bulk() {
            Ok(data) => data,
            Err(e) => {
                warn!("bulk read failed: {}", e);
                return;
            }
        };

        for candidate in reader.feed(&data) {
            if !codec::is_frame_valid(&candidate) {
                continue;
            }
            let frame = codec::decode_frame(&candidate);

            let mut s = session.lock().unwrap();
            s.voltage = frame.voltage;
            s.current = frame.current;
            s.mah = f64::from(frame.mah);
            match frame.status {
                STATUS_DISCHARGING => {
                    s.is_discharging = true;
                    s.is_charging = false;
                }
                STATUS_CHARGING => {
                    s.is_charging = true;
                    s.is_discharging = false;
                }
                STATUS_IDLE | STATUS_IDLE_ALT | STATUS_DISCHARGE_DONE | STATUS_CHARGE_DONE => {
                    s.is_charging = false;
                    s.is_discharging = false;
                }
                other => debug!("unknown status byte {:#04x}", other),
            }
            drop(s);

            if let Some(cb) = callback.lock().unwrap().as_ref() {
                cb(frame.voltage, frame.current, f64::from(frame.mah));
            }
        }
    }

    /// Run one poll cycle on the caller's thread (the monitor loop does
    /// exactly this every interval).
    pub(crate) fn poll_once(&self, reader: &mut FrameReader) {
        Self::poll_cycle(&self.device, &self.session, &self.callback, reader);
    }

    /// Spawn the background poll loop. Must run inside a tokio runtime;
    /// the loop itself lives on a blocking thread because the USB reads
    /// are synchronous.
    pub fn start_monitoring(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let device = Arc::clone(&self.device);
        let session = Arc::clone(&self.session);
        let callback = Arc::clone(&self.callback);
        let running = Arc::clone(&self.running);

        let handle = tokio::task::spawn_blocking(move || {
            let mut reader = FrameReader::new();
            while running.load(Ordering::SeqCst) {
                Self::poll_cycle(&device, &session, &callback, &mut reader);
                thread::sleep(Duration::from_millis(MONITOR_INTERVAL_MS));
            }
            debug!("monitoring stopped");
        });
        *self.monitor.lock().unwrap() = Some(handle);
    }

    /// Clear the running flag and wait for the poll task to observe it
    /// and exit. Only after this returns is it safe to [`destroy`](Self::destroy)
    /// the driver.
    pub async fn stop_monitoring(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.monitor.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("monitor task join failed: {}", e);
            }
        }
    }

    /// Release the USB claim and reattach the kernel driver if one was
    /// detached at open time. Refused while the poll loop still runs:
    /// releasing the interface under an in-flight read is undefined
    /// behavior on the hardware layer.
    pub fn destroy(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(StationError::MonitorRunning);
        }
        self.device.lock().unwrap().release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedDevice;

    fn sim_driver() -> EbcB20h {
        EbcB20h::with_device(HardwareDevice::Simulated(SimulatedDevice::default()))
    }

    fn last_write(driver: &EbcB20h) -> Vec<u8> {
        match &*driver.device.lock().unwrap() {
            HardwareDevice::Simulated(sim) => sim.writes().last().cloned().unwrap(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn connect_replays_full_handshake() {
        let driver = sim_driver();
        driver.connect().unwrap();

        let transfers = match &*driver.device.lock().unwrap() {
            HardwareDevice::Simulated(sim) => sim.control_transfers,
            _ => unreachable!(),
        };
        assert_eq!(transfers, CONNECT_HANDSHAKE.len());
        assert_eq!(last_write(&driver), vec![0xFA, 0x05, 0, 0, 0, 0, 0, 0, 0x05, 0xF8]);
    }

    #[test]
    fn discharge_clamps_to_device_limits() {
        let driver = sim_driver();
        driver.discharge(100.0, 1.0).unwrap();

        // 20.0 A and 2.0 V after clamping
        let (c_msb, c_lsb) = codec::encode_current(20.0);
        let (v_msb, v_lsb) = codec::encode_voltage(2.0);
        let body = [CMD_DISCHARGE, c_msb, c_lsb, v_msb, v_lsb, 0, 0];
        assert_eq!(last_write(&driver), codec::frame_command(&body).to_vec());
        assert!(driver.is_discharging());
        assert!(!driver.is_charging());
    }

    #[test]
    fn charge_engagement_commands() {
        let driver = sim_driver();
        driver.charge(0.1).unwrap();
        assert_eq!(last_write(&driver)[1], CMD_CHARGE);
        assert!(driver.is_charging());

        // already engaged: re-issue with the continuing command
        driver.charge(0.1).unwrap();
        assert_eq!(last_write(&driver)[1], CMD_CHARGE_CONT);
        assert!(driver.is_charging());
        assert!(!driver.is_discharging());
    }

    #[test]
    fn adjust_leaves_flags_untouched() {
        let driver = sim_driver();
        driver.discharge(2.0, 20.0).unwrap();
        driver.adjust(5.0, 20.0).unwrap();
        assert_eq!(last_write(&driver)[1], CMD_ADJUST);
        assert!(driver.is_discharging());
    }

    #[test]
    fn poll_updates_session_and_callback() {
        let driver = sim_driver();
        let seen: Arc<Mutex<Vec<(f64, f64, f64)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        driver.subscribe(move |v, c, m| sink.lock().unwrap().push((v, c, m)));

        driver.discharge(2.0, 20.0).unwrap();
        let mut reader = FrameReader::new();
        driver.poll_once(&mut reader);

        assert!(driver.voltage() > 0.0);
        assert_eq!(driver.current(), 2.0);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, driver.voltage());
    }

    #[test]
    fn end_of_discharge_clears_flags() {
        let driver = EbcB20h::with_device(HardwareDevice::Simulated(
            SimulatedDevice::with_battery(20.5, 0.3),
        ));
        driver.discharge(2.0, 20.0).unwrap();
        assert!(driver.is_discharging());

        let mut reader = FrameReader::new();
        for _ in 0..5 {
            driver.poll_once(&mut reader);
        }
        assert!(!driver.is_discharging());
        assert!(!driver.is_charging());
        assert!(driver.mah() > 0.0);
    }

    #[tokio::test]
    async fn destroy_refused_until_monitor_joined() {
        let driver = sim_driver();
        driver.start_monitoring();
        assert!(driver.is_monitoring());
        assert!(matches!(driver.destroy(), Err(StationError::MonitorRunning)));

        driver.stop_monitoring().await;
        assert!(!driver.is_monitoring());
        driver.destroy().unwrap();
    }
}
