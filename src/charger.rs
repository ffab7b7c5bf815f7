//! Driver for the Deligreen Q2-1.5KWh CAN charger.
//!
//! The charger expects its setpoint as a periodic extended-ID message;
//! if the broadcast stops it shuts down on its own communication
//! timeout. Updating a running charge swaps the payload in place rather
//! than restarting the task, so output ramps are not interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::constants::*;
use crate::error::{Result, StationError};
use crate::hardware::CanLink;

/// Fault bits of the charger status frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChargerFlags {
    pub hardware_failure: bool,
    pub overheat: bool,
    pub bad_input_voltage: bool,
    pub battery_disconnected: bool,
    pub comms_timeout: bool,
}

impl ChargerFlags {
    fn from_byte(byte: u8) -> Self {
        Self {
            hardware_failure: byte & 0x01 != 0,
            overheat: byte & 0x02 != 0,
            bad_input_voltage: byte & 0x04 != 0,
            battery_disconnected: byte & 0x08 != 0,
            comms_timeout: byte & 0x10 != 0,
        }
    }
}

/// Decoded charger status frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChargerStatus {
    /// Output voltage in volts
    pub voltage: f64,
    /// Output current in amps
    pub current: f64,
    /// Internal temperature in degrees Celsius
    pub temperature: i16,
    pub flags: ChargerFlags,
}

pub struct Q2Charger {
    bus: Arc<Mutex<CanLink>>,
    payload: Arc<Mutex<[u8; 8]>>,
    charging: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Q2Charger {
    /// Open the charger on the station's CAN interface.
    pub fn open() -> Result<Self> {
        Ok(Self::with_bus(CanLink::open(CAN_INTERFACE)?))
    }

    pub fn with_bus(bus: CanLink) -> Self {
        Self {
            bus: Arc::new(Mutex::new(bus)),
            payload: Arc::new(Mutex::new([0; 8])),
            charging: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    pub fn is_charging(&self) -> bool {
        self.charging.load(Ordering::SeqCst)
    }

    /// Build the fixed-format setpoint payload.
    pub fn build_setpoint(current: f64, voltage: f64) -> [u8; 8] {
        let v = voltage * 10.0;
        let v_msb = (v / 256.0) as u8;
        let v_lsb = (v - f64::from(v_msb) * 256.0) as u8;
        let c = current * 10.0;
        let c_msb = (c / 256.0) as u8;
        let c_lsb = (c - f64::from(c_msb) * 256.0) as u8;
        [v_msb, v_lsb, c_msb, c_lsb, 0, 0, 0, 0]
    }

    /// Command a charge. The first engagement starts the 1 Hz setpoint
    /// broadcast; afterwards only the payload is swapped.
    ///
    /// Must run inside a tokio runtime on first engagement.
    pub fn charge(&self, current: f64, voltage: f64) -> Result<()> {
        let setpoint = Self::build_setpoint(current, voltage);
        *self.payload.lock().unwrap() = setpoint;

        if self.charging.load(Ordering::SeqCst) {
            info!("charging updated: {:.1} A / {:.1} V", current, voltage);
            return Ok(());
        }

        let bus = Arc::clone(&self.bus);
        let payload = Arc::clone(&self.payload);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(CHARGER_PERIOD_MS));
            loop {
                ticker.tick().await;
                let frame = *payload.lock().unwrap();
                if let Err(e) = bus.lock().unwrap().send(CHARGER_SETPOINT_ID, &frame) {
                    warn!("charger setpoint send failed: {}", e);
                }
            }
        });
        *self.task.lock().unwrap() = Some(handle);
        self.charging.store(true, Ordering::SeqCst);
        info!("charging started: {:.1} A / {:.1} V", current, voltage);
        Ok(())
    }

    /// Cancel the periodic broadcast.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        if self.charging.swap(false, Ordering::SeqCst) {
            info!("charging stopped");
        }
    }

    /// Decode one 8-byte status payload.
    pub fn decode_frame(data: &[u8]) -> Result<ChargerStatus> {
        if data.len() < 6 {
            return Err(StationError::Parse(format!(
                "charger status frame too short: {} bytes",
                data.len()
            )));
        }
        Ok(ChargerStatus {
            voltage: (f64::from(data[0]) * 255.0 + f64::from(data[1])) / 10.0,
            current: (f64::from(data[2]) * 255.0 + f64::from(data[3])) / 10.0,
            temperature: i16::from(data[5]) - CHARGER_TEMP_BIAS,
            flags: ChargerFlags::from_byte(data[4]),
        })
    }

    /// Read one status frame, skipping unrelated traffic. `Ok(None)`
    /// when nothing relevant arrived within the link timeout.
    pub fn read_status(&self) -> Result<Option<ChargerStatus>> {
        loop {
            let received = self.bus.lock().unwrap().recv()?;
            match received {
                Some((id, data)) if id == CHARGER_STATUS_ID => {
                    return Ok(Some(Self::decode_frame(&data)?));
                }
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }
}

impl Drop for Q2Charger {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}
