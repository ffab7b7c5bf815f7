//! Operation sequencer for the test station.
//!
//! One [`DeviceController`] owns both actuator drivers and the ordered
//! operation queue. A fixed-period tick reconciles the queue with the
//! live battery state coming out of the discharger's poll loop; decoded
//! telemetry flows in over a channel and lands, deduplicated, on the
//! active operation's chart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::charger::Q2Charger;
use crate::constants::*;
use crate::discharger::EbcB20h;
use crate::error::Result;
use crate::hardware::{CanLink, HardwareDevice};
use crate::types::*;

/// Aggregate device state; single owner, mutated only under its lock.
struct DeviceState {
    battery_state: BatteryState,
    prev_state: BatteryState,
    mode: DeviceMode,
    voltage: f64,
    current: f64,
    mah: f64,
    capacity: f64,
    operations: Vec<Operation>,
    cursor: Option<usize>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            battery_state: BatteryState::Idle,
            prev_state: BatteryState::Idle,
            mode: DeviceMode::Idle,
            voltage: 0.0,
            current: 0.0,
            mah: 0.0,
            capacity: 0.0,
            operations: Vec::new(),
            cursor: None,
        }
    }
}

pub struct DeviceController {
    discharger: Arc<EbcB20h>,
    charger: Arc<Q2Charger>,
    state: Arc<Mutex<DeviceState>>,
    degraded: bool,
    running: Arc<AtomicBool>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceController {
    /// Build a controller against the real hardware, substituting the
    /// simulated variants for whatever is not reachable so the station
    /// keeps functioning for testing or demo purposes.
    pub fn new() -> Self {
        let mut degraded = false;
        let discharger = match EbcB20h::open() {
            Ok(discharger) => discharger,
            Err(e) => {
                warn!("discharger unavailable ({}); running simulated", e);
                degraded = true;
                EbcB20h::with_device(HardwareDevice::simulated())
            }
        };
        let charger = match Q2Charger::open() {
            Ok(charger) => charger,
            Err(e) => {
                warn!("charger unavailable ({}); running simulated", e);
                degraded = true;
                Q2Charger::with_bus(CanLink::simulated())
            }
        };
        let mut controller = Self::with_devices(discharger, charger);
        controller.degraded = degraded;
        controller
    }

    pub fn with_devices(discharger: EbcB20h, charger: Q2Charger) -> Self {
        Self {
            discharger: Arc::new(discharger),
            charger: Arc::new(charger),
            state: Arc::new(Mutex::new(DeviceState::default())),
            degraded: false,
            running: Arc::new(AtomicBool::new(false)),
            tick_task: Mutex::new(None),
        }
    }

    /// True when at least one actuator is a simulated stand-in.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn discharger(&self) -> &EbcB20h {
        &self.discharger
    }

    pub fn charger(&self) -> &Q2Charger {
        &self.charger
    }

    /// Connect the discharger, start its poll loop and the sequencer
    /// tick. Must run inside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.discharger.connect() {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.discharger.subscribe(move |voltage, current, mah| {
            let _ = tx.send(Datapoint { voltage, current, mah });
        });
        self.discharger.start_monitoring();

        let state = Arc::clone(&self.state);
        let discharger = Arc::clone(&self.discharger);
        let charger = Arc::clone(&self.charger);
        let running = Arc::clone(&self.running);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                while let Ok(datapoint) = rx.try_recv() {
                    Self::ingest(&state, datapoint);
                }
                Self::tick(&state, &discharger, &charger);
            }
        });
        *self.tick_task.lock().unwrap() = Some(handle);
        info!("device controller started");
        Ok(())
    }

    /// Orderly shutdown: stop the sequencer tick, the actuators, then
    /// the poll loop (joined) before releasing the USB claim.
    pub async fn shutdown(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.tick_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.stop_all();
        self.discharger.stop_monitoring().await;
        if let Err(e) = self.discharger.disconnect() {
            warn!("disconnect failed: {}", e);
        }
        self.discharger.destroy()?;
        info!("device controller shut down");
        Ok(())
    }

    /// Append a step to the queue. A step whose family matches the
    /// immediately preceding one is coalesced into its continue variant,
    /// avoiding a redundant actuator restart between the two.
    pub fn add_operation(&self, kind: OperationKind, params: HashMap<String, f64>) {
        let mut st = self.state.lock().unwrap();
        let kind = match st.operations.last() {
            Some(prev) if prev.kind.same_family(kind) => kind.continued(),
            _ => kind,
        };
        info!("operation added: {:?}", kind);
        st.operations.push(Operation::new(kind, params));
    }

    /// Remove a still-pending, not-yet-reached step. Anything else is a
    /// silent no-op; callers check the resulting list if they need
    /// confirmation.
    pub fn delete_operation(&self, index: usize) {
        let mut st = self.state.lock().unwrap();
        if index >= st.operations.len() {
            return;
        }
        if st.cursor.map_or(false, |cursor| index <= cursor) {
            return;
        }
        if st.operations[index].status != OpStatus::Pending {
            return;
        }
        st.operations.remove(index);
        info!("operation {} deleted", index);
    }

    pub fn clear_operations(&self) {
        let mut st = self.state.lock().unwrap();
        st.operations.clear();
        st.cursor = None;
        info!("operations cleared");
    }

    /// Arm the sequencer: the next tick advances into the first queued
    /// step. No-op while a sequence is already running or the queue is
    /// empty.
    pub fn start_next_operation(&self) {
        let mut st = self.state.lock().unwrap();
        if st.operations.is_empty() || st.mode != DeviceMode::Idle {
            return;
        }
        for op in &mut st.operations {
            op.status = OpStatus::Pending;
            op.result = OpResult::default();
            op.chart.clear();
            op.t_start = None;
            op.t_end = None;
            op.started = None;
        }
        st.cursor = None;
        st.mode = DeviceMode::BetweenOperations;
        info!("operation sequence armed ({} steps)", st.operations.len());
    }

    /// Manual charge command, outside any queued sequence.
    pub fn charge(&self, current: f64, max_voltage: f64) -> Result<()> {
        if self.discharger.is_discharging() {
            self.discharger.stop()?;
        }
        self.charger.charge(current, max_voltage)?;
        self.discharger.charge(PASSTHROUGH_CUTOFF_A)?;
        self.state.lock().unwrap().battery_state = BatteryState::Charging;
        info!("charging at {} A and {} V max voltage", current, max_voltage);
        Ok(())
    }

    /// Manual discharge command, outside any queued sequence.
    pub fn discharge(&self, current: f64, min_voltage: f64) -> Result<()> {
        if self.charger.is_charging() {
            self.charger.stop();
        }
        self.discharger.discharge(current, min_voltage)?;
        self.state.lock().unwrap().battery_state = BatteryState::Discharging;
        info!("discharging at {} A down to {} V", current, min_voltage);
        Ok(())
    }

    /// Measure capacity by queueing a full charge followed by a
    /// discharge down to the cutoff, then arming the sequencer.
    pub fn measure_capacity(
        &self,
        charge_current: f64,
        charge_voltage: f64,
        discharge_current: f64,
        cutoff_voltage: f64,
    ) {
        let mut charge_params = HashMap::new();
        charge_params.insert("current".to_string(), charge_current);
        charge_params.insert("voltage".to_string(), charge_voltage);
        let mut discharge_params = HashMap::new();
        discharge_params.insert("current".to_string(), discharge_current);
        discharge_params.insert("voltage".to_string(), cutoff_voltage);

        self.add_operation(OperationKind::Charge, charge_params);
        self.add_operation(OperationKind::Discharge, discharge_params);
        self.state.lock().unwrap().capacity = 0.0;
        self.start_next_operation();
        info!("measuring capacity");
    }

    /// Stop both actuators, reset every operation to pending and the
    /// cursor to before the first step.
    pub fn stop_all(&self) {
        if self.charger.is_charging() {
            self.charger.stop();
        }
        if self.discharger.is_charging() || self.discharger.is_discharging() {
            if let Err(e) = self.discharger.stop() {
                error!("failed to stop discharger: {}", e);
            }
        }

        let mut st = self.state.lock().unwrap();
        for op in &mut st.operations {
            op.status = OpStatus::Pending;
        }
        st.cursor = None;
        st.mode = DeviceMode::Idle;
        st.battery_state = BatteryState::Idle;
        info!("stop all");
    }

    /// Read-only state for the front end.
    pub fn snapshot(&self) -> StateSnapshot {
        let st = self.state.lock().unwrap();
        StateSnapshot {
            mode: st.mode,
            battery_state: st.battery_state,
            battery_voltage: st.voltage,
            battery_current: st.current,
            battery_mah: st.mah,
            battery_capacity: st.capacity,
            operation_index: st.cursor.map_or(-1, |cursor| cursor as i64),
            operations: st.operations.clone(),
        }
    }

    /// Telemetry sink: latest values plus one deduplicated chart entry
    /// on the active operation.
    fn ingest(state: &Mutex<DeviceState>, datapoint: Datapoint) {
        let mut st = state.lock().unwrap();
        st.voltage = datapoint.voltage;
        st.current = datapoint.current;
        st.mah = datapoint.mah;

        let Some(index) = st.cursor else { return };
        let Some(op) = st.operations.get_mut(index) else { return };
        if op.status != OpStatus::Ongoing {
            return;
        }
        // identical consecutive readings collapse into one entry
        if let Some(last) = op.chart.last() {
            if last.voltage == datapoint.voltage
                && last.current == datapoint.current
                && last.mah == datapoint.mah
            {
                return;
            }
        }
        let t = op.started.map_or(0.0, |started| started.elapsed().as_secs_f64());
        op.chart.push(ChartPoint {
            t,
            voltage: datapoint.voltage,
            current: datapoint.current,
            mah: datapoint.mah,
        });
    }

    /// One sequencer tick: refresh the battery state from the
    /// discharger, detect completion of the active step, advance the
    /// cursor and dispatch the next one.
    fn tick(state: &Mutex<DeviceState>, discharger: &EbcB20h, charger: &Q2Charger) {
        let mut st = state.lock().unwrap();

        st.battery_state = if discharger.is_charging() {
            BatteryState::Charging
        } else if discharger.is_discharging() {
            BatteryState::Discharging
        } else {
            BatteryState::Idle
        };
        st.voltage = discharger.voltage();
        st.current = discharger.current();
        st.mah = discharger.mah();

        match st.mode {
            DeviceMode::InOperation => {
                // edge-triggered: only a return to idle from a non-idle
                // previous state ends a step
                let idle_edge = st.battery_state == BatteryState::Idle
                    && st.prev_state != BatteryState::Idle;

                let mut finished = false;
                let mut timed_out = false;
                let active = st.cursor.filter(|&index| index < st.operations.len());
                match active {
                    Some(index) => {
                        let op = &mut st.operations[index];
                        timed_out = match (op.duration(), op.started) {
                            (Some(duration), Some(started)) => {
                                started.elapsed().as_secs_f64() >= duration
                            }
                            _ => false,
                        };
                        let edge_done = op.kind != OperationKind::Wait && idle_edge;
                        if edge_done || timed_out {
                            op.status = OpStatus::Finished;
                            op.result = OpResult {
                                code: 0,
                                reason: if timed_out { "duration elapsed" } else { "completed" }
                                    .to_string(),
                            };
                            op.t_end = Some(Utc::now());
                            finished = true;
                        }
                    }
                    None => {
                        // queue pulled out from under a running step
                        st.mode = DeviceMode::Idle;
                    }
                }
                if finished {
                    st.capacity = st.mah;
                    st.mode = DeviceMode::BetweenOperations;
                    info!(
                        "operation finished ({})",
                        if timed_out { "duration elapsed" } else { "completed" }
                    );
                }
            }
            DeviceMode::BetweenOperations => {
                let next = st.cursor.map_or(0, |cursor| cursor + 1);
                if next < st.operations.len() {
                    st.cursor = Some(next);
                    Self::dispatch(&mut st, next, discharger, charger);
                } else {
                    st.mode = DeviceMode::Idle;
                    if charger.is_charging() {
                        charger.stop();
                    }
                    if discharger.is_charging() || discharger.is_discharging() {
                        if let Err(e) = discharger.stop() {
                            error!("failed to stop discharger: {}", e);
                        }
                    }
                    info!("operation sequence finished");
                }
            }
            DeviceMode::Idle => {}
        }

        st.prev_state = st.battery_state;
    }

    /// Issue the actuator commands for one step. Failures are logged,
    /// not retried; the flags resolve from real device state on a later
    /// tick.
    fn dispatch(st: &mut DeviceState, index: usize, discharger: &EbcB20h, charger: &Q2Charger) {
        let (kind, current, voltage) = {
            let op = &mut st.operations[index];
            op.status = OpStatus::Ongoing;
            op.t_start = Some(Utc::now());
            op.started = Some(Instant::now());
            (
                op.kind,
                op.param("current").unwrap_or(0.0),
                op.param("voltage").unwrap_or(0.0),
            )
        };
        st.mode = DeviceMode::InOperation;
        info!("starting operation {}: {:?}", index, kind);

        // a command that conflicts with the other actuator's state first
        // stops that actuator
        let outcome: Result<()> = (|| {
            match kind {
                OperationKind::Charge | OperationKind::ChargeContinue => {
                    if discharger.is_discharging() {
                        discharger.stop()?;
                    }
                    charger.charge(current, voltage)?;
                    discharger.charge(PASSTHROUGH_CUTOFF_A)?;
                }
                OperationKind::Discharge | OperationKind::DischargeContinue => {
                    if charger.is_charging() {
                        charger.stop();
                    }
                    discharger.discharge(current, voltage)?;
                }
                OperationKind::Wait => {
                    if charger.is_charging() {
                        charger.stop();
                    }
                    if discharger.is_charging() || discharger.is_discharging() {
                        discharger.stop()?;
                    }
                }
                OperationKind::Adjust => {
                    discharger.adjust(current, voltage)?;
                }
            }
            Ok(())
        })();
        if let Err(e) = outcome {
            error!("operation {} actuator command failed: {}", index, e);
        }
    }
}

impl Default for DeviceController {
    fn default() -> Self {
        Self::new()
    }
}
