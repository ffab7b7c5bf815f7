//! Bench Cycle Example
//!
//! This example demonstrates the core functionality of the battest library:
//! - Building a station controller with automatic simulated fallback
//! - Queueing a multi-step test sequence (discharge, wait)
//! - Following the sequence to completion through state snapshots
//! - Orderly shutdown of both actuators and the poll loop
//!
//! Usage:
//!   cargo run --example bench_cycle
//!
//! Set RUST_LOG environment variable to control logging:
//!   RUST_LOG=debug cargo run --example bench_cycle
//!   RUST_LOG=info cargo run --example bench_cycle

use std::collections::HashMap;
use std::time::Duration;

use battest::{DeviceController, DeviceMode, OpStatus, OperationKind, Result};
use log::info;

fn params(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger with default info level if RUST_LOG is not set
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let station = DeviceController::new();
    if station.is_degraded() {
        info!("hardware not detected, running against simulated devices");
    }
    station.start()?;

    station.add_operation(
        OperationKind::Discharge,
        params(&[("current", 2.0), ("voltage", 24.0)]),
    );
    station.add_operation(OperationKind::Wait, params(&[("duration", 10.0)]));
    station.start_next_operation();

    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let snapshot = station.snapshot();
        info!(
            "mode {:?} | battery {:?} | {:.2} V, {:.2} A, {:.0} mAh",
            snapshot.mode,
            snapshot.battery_state,
            snapshot.battery_voltage,
            snapshot.battery_current,
            snapshot.battery_mah,
        );

        let all_finished = snapshot
            .operations
            .iter()
            .all(|op| op.status == OpStatus::Finished);
        if snapshot.mode == DeviceMode::Idle && all_finished {
            info!(
                "sequence finished, measured capacity {:.0} mAh",
                snapshot.battery_capacity
            );
            break;
        }
    }

    station.shutdown().await?;
    Ok(())
}
