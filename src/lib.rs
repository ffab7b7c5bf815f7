//! # Battest
//!
//! A Rust library for driving a bench battery-test station. A ZKETECH
//! EBC-B20H electronic-load discharger (reached over its CH340 USB
//! bridge) and a Deligreen Q2 charger (reached over SocketCAN) are
//! coordinated to run multi-step test sequences (charge, discharge,
//! wait, adjust) against a battery, while continuously sampling
//! voltage, current and accumulated charge.
//!
//! ## Features
//!
//! - Reverse-engineered EBC-B20H wire protocol: framing, XOR checksum,
//!   the device's non-linear numeric encodings, and the captured
//!   connect handshake
//! - Background telemetry poll loop with a per-frame subscription
//! - Periodic CAN setpoint broadcast for the charger, updated in place
//! - Operation sequencer with step coalescing and completion detection
//!   from elapsed time or actuator status transitions
//! - Simulated and log-replay hardware variants, so the station keeps
//!   functioning with no devices attached
//!
//! ## Example
//!
//! ```no_run
//! use battest::{DeviceController, OperationKind};
//! use std::collections::HashMap;
//!
//! #[tokio::main]
//! async fn main() -> battest::Result<()> {
//!     let station = DeviceController::new();
//!     station.start()?;
//!
//!     let mut params = HashMap::new();
//!     params.insert("current".to_string(), 2.0);
//!     params.insert("voltage".to_string(), 24.0);
//!     station.add_operation(OperationKind::Discharge, params);
//!     station.start_next_operation();
//!
//!     // ... poll station.snapshot() until the sequence finishes ...
//!     station.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod charger;
pub mod codec;
pub mod constants;
pub mod controller;
pub mod discharger;
pub mod error;
pub mod hardware;
pub mod types;

pub use charger::{ChargerFlags, ChargerStatus, Q2Charger};
pub use controller::DeviceController;
pub use discharger::EbcB20h;
pub use error::{Result, StationError};
pub use hardware::{CanLink, HardwareDevice};
pub use types::*;
