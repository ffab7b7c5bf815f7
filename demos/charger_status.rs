//! Charger Status Example
//!
//! Listens on the CAN bus and decodes the Q2 charger's periodic status
//! frames: output voltage and current, internal temperature, and the
//! fault flag field.
//!
//! Usage:
//!   cargo run --example charger_status
//!
//! Set RUST_LOG environment variable to control logging:
//!   RUST_LOG=info cargo run --example charger_status

use std::thread;
use std::time::Duration;

use battest::{Q2Charger, Result};
use log::info;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let charger = Q2Charger::open()?;
    info!("listening for charger status frames");

    loop {
        if let Some(status) = charger.read_status()? {
            info!(
                "{:.1} V, {:.1} A, {} degC | faults: {:?}",
                status.voltage, status.current, status.temperature, status.flags
            );
        }
        thread::sleep(Duration::from_millis(200));
    }
}
