use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// What the battery is doing, as inferred from the discharger's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryState {
    Idle,
    Charging,
    Discharging,
}

/// Sequencer mode of the station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMode {
    Idle,
    InOperation,
    BetweenOperations,
}

/// Lifecycle of one operation; only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Pending,
    Ongoing,
    Finished,
}

/// One step type in a test sequence.
///
/// The `*Continue` variants mark a step coalesced with its predecessor
/// of the same family, so the actuators are re-commanded without a full
/// restart between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Charge,
    ChargeContinue,
    Discharge,
    DischargeContinue,
    Wait,
    Adjust,
}

impl OperationKind {
    /// Charge and discharge steps form families; `Wait` and `Adjust`
    /// never coalesce.
    pub fn same_family(self, other: OperationKind) -> bool {
        use OperationKind::*;
        matches!(
            (self, other),
            (Charge | ChargeContinue, Charge | ChargeContinue)
                | (Discharge | DischargeContinue, Discharge | DischargeContinue)
        )
    }

    /// The coalesced form of this kind.
    pub fn continued(self) -> OperationKind {
        match self {
            OperationKind::Charge | OperationKind::ChargeContinue => OperationKind::ChargeContinue,
            OperationKind::Discharge | OperationKind::DischargeContinue => {
                OperationKind::DischargeContinue
            }
            other => other,
        }
    }
}

/// Outcome of a finished operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpResult {
    pub code: i32,
    pub reason: String,
}

impl Default for OpResult {
    fn default() -> Self {
        Self { code: 0, reason: "pending".to_string() }
    }
}

/// One datapoint on an operation's chart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    /// Seconds since the operation started
    pub t: f64,
    pub voltage: f64,
    pub current: f64,
    pub mah: f64,
}

/// One decoded telemetry sample from the discharger's poll loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Datapoint {
    pub voltage: f64,
    pub current: f64,
    pub mah: f64,
}

/// One step of a user-defined test sequence.
///
/// Owned exclusively by the controller's operation list and mutated
/// only as the sequencer executes it.
#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    pub kind: OperationKind,
    /// `current`, `voltage`, and optionally `duration` (seconds)
    pub params: HashMap<String, f64>,
    pub status: OpStatus,
    pub result: OpResult,
    pub chart: Vec<ChartPoint>,
    pub t_start: Option<DateTime<Utc>>,
    pub t_end: Option<DateTime<Utc>>,
    /// Monotonic start used for elapsed-time math
    #[serde(skip)]
    pub(crate) started: Option<Instant>,
}

impl Operation {
    pub fn new(kind: OperationKind, params: HashMap<String, f64>) -> Self {
        Self {
            kind,
            params,
            status: OpStatus::Pending,
            result: OpResult::default(),
            chart: Vec::new(),
            t_start: None,
            t_end: None,
            started: None,
        }
    }

    pub fn param(&self, name: &str) -> Option<f64> {
        self.params.get(name).copied()
    }

    /// Timed-completion setting, if one is configured.
    pub fn duration(&self) -> Option<f64> {
        self.param("duration").filter(|d| *d > 0.0)
    }
}

/// Read-only view of the station handed to the front end.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub mode: DeviceMode,
    pub battery_state: BatteryState,
    pub battery_voltage: f64,
    pub battery_current: f64,
    pub battery_mah: f64,
    /// Last measured capacity in mAh
    pub battery_capacity: f64,
    /// Index of the current operation, −1 before the first step
    pub operation_index: i64,
    pub operations: Vec<Operation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_families() {
        use OperationKind::*;
        assert!(Charge.same_family(ChargeContinue));
        assert!(Discharge.same_family(Discharge));
        assert!(!Charge.same_family(Discharge));
        assert!(!Wait.same_family(Wait));
        assert!(!Adjust.same_family(Discharge));
        assert_eq!(Charge.continued(), ChargeContinue);
        assert_eq!(DischargeContinue.continued(), DischargeContinue);
        assert_eq!(Wait.continued(), Wait);
    }

    #[test]
    fn duration_requires_positive_setting() {
        let mut op = Operation::new(OperationKind::Wait, HashMap::new());
        assert_eq!(op.duration(), None);
        op.params.insert("duration".to_string(), 0.0);
        assert_eq!(op.duration(), None);
        op.params.insert("duration".to_string(), 30.0);
        assert_eq!(op.duration(), Some(30.0));
    }

    #[test]
    fn operation_serializes_for_the_front_end() {
        let mut params = HashMap::new();
        params.insert("current".to_string(), 2.0);
        let op = Operation::new(OperationKind::Discharge, params);
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "discharge");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["params"]["current"], 2.0);
    }
}
