//! Protocol constants for the EBC-B20H discharger and Q2 charger links.
//!
//! This module defines all the constants used on both actuator links:
//! USB identifiers and endpoints, frame markers, command and status
//! bytes, device safety limits, loop cadences, and the CAN identifiers
//! of the charger.

/// USB vendor ID of the CH340 bridge inside the EBC-B20H (QinHeng Electronics)
pub const VENDOR_ID: u16 = 0x1a86;

/// USB product ID (HL-340 USB-Serial adapter)
pub const PRODUCT_ID: u16 = 0x7523;

/// Bulk OUT endpoint carrying command frames
pub const ENDPOINT_OUT: u8 = 0x02;

/// Bulk IN endpoint carrying telemetry frames
pub const ENDPOINT_IN: u8 = 0x82;

/// Size of one bulk read request
pub const READ_CHUNK: usize = 128;

/// Bulk read timeout in milliseconds; expiry means "no data", not an error
pub const READ_TIMEOUT_MS: u64 = 200;

/// Bulk write timeout in milliseconds
pub const WRITE_TIMEOUT_MS: u64 = 100;

/// Start-of-frame marker
pub const FRAME_START: u8 = 0xFA;

/// End-of-frame marker
pub const FRAME_END: u8 = 0xF8;

/// Length of a complete telemetry frame, markers and checksum included
pub const FRAME_LEN: usize = 19;

/// Length of a command body (before framing and checksum)
pub const CMD_BODY_LEN: usize = 7;

/// Start a discharge
pub const CMD_DISCHARGE: u8 = 0x01;

/// Stop whatever the discharger is doing
pub const CMD_STOP: u8 = 0x02;

/// Connect (sent once after the USB handshake)
pub const CMD_CONNECT: u8 = 0x05;

/// Disconnect
pub const CMD_DISCONNECT: u8 = 0x06;

/// Adjust an in-flight discharge without restarting it
pub const CMD_ADJUST: u8 = 0x07;

/// Enter passthrough charge monitoring (first engagement)
pub const CMD_CHARGE: u8 = 0x11;

/// Re-issue passthrough charge monitoring (continuing engagement)
pub const CMD_CHARGE_CONT: u8 = 0x18;

/// Telemetry status byte: idle
pub const STATUS_IDLE: u8 = 0x00;

/// Telemetry status byte: idle (alternate encoding)
pub const STATUS_IDLE_ALT: u8 = 0x01;

/// Telemetry status byte: discharging
pub const STATUS_DISCHARGING: u8 = 0x0A;

/// Telemetry status byte: charging (passthrough)
pub const STATUS_CHARGING: u8 = 0x0B;

/// Telemetry status byte: discharge reached its cutoff
pub const STATUS_DISCHARGE_DONE: u8 = 0x14;

/// Telemetry status byte: charge reached its cutoff
pub const STATUS_CHARGE_DONE: u8 = 0x15;

/// Smallest commandable current in amps
pub const MIN_CURRENT_A: f64 = 0.1;

/// The EBC-B20H is limited to 20 amps discharge current
pub const MAX_CURRENT_A: f64 = 20.0;

/// Lowest commandable cutoff voltage in volts
pub const MIN_CUTOFF_V: f64 = 2.0;

/// Highest commandable cutoff voltage in volts
pub const MAX_CUTOFF_V: f64 = 72.0;

/// Cutoff current used when the discharger merely monitors an external charge
pub const PASSTHROUGH_CUTOFF_A: f64 = 0.1;

/// Telemetry poll loop period in milliseconds
pub const MONITOR_INTERVAL_MS: u64 = 2000;

/// Operation state machine tick period in milliseconds
pub const TICK_INTERVAL_MS: u64 = 300;

/// Period of the charger setpoint broadcast in milliseconds
pub const CHARGER_PERIOD_MS: u64 = 1000;

/// CAN interface the Q2 charger is wired to
pub const CAN_INTERFACE: &str = "can0";

/// Extended CAN ID the charger listens on for setpoint messages
pub const CHARGER_SETPOINT_ID: u32 = 0x1806E5F4;

/// Extended CAN ID the charger emits status frames on
pub const CHARGER_STATUS_ID: u32 = 0x18FF50E5;

/// Bias subtracted from the raw charger temperature byte, in degrees Celsius
pub const CHARGER_TEMP_BIAS: i16 = 100;

/// One vendor control transfer of the captured connect handshake.
///
/// `read_len` is `None` for host-to-device transfers and `Some(n)` for
/// device-to-host transfers reading `n` bytes.
#[derive(Debug, Clone, Copy)]
pub struct ControlStep {
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub read_len: Option<u16>,
}

/// ZKETECH EBC-B20H handshake between the official software and the
/// device, as seen with a USB analyzer. Replayed verbatim on connect;
/// the byte/value pairs come straight from the capture and are not
/// negotiable.
pub const CONNECT_HANDSHAKE: &[ControlStep] = &[
    ControlStep { request: 0xa1, value: 0xc39c, index: 0xd98a, read_len: None },
    ControlStep { request: 0x95, value: 0x2c2c, index: 0x0000, read_len: Some(2) },
    ControlStep { request: 0x9a, value: 0x0f2c, index: 0x0007, read_len: None },
    ControlStep { request: 0xa4, value: 0x00df, index: 0x0000, read_len: None },
    ControlStep { request: 0xa4, value: 0x009f, index: 0x0000, read_len: None },
    ControlStep { request: 0x95, value: 0x0706, index: 0x0000, read_len: Some(2) },
    ControlStep { request: 0x9a, value: 0x2727, index: 0x0000, read_len: None },
    ControlStep { request: 0x9a, value: 0x1312, index: 0xb282, read_len: None },
    ControlStep { request: 0x95, value: 0x2c2c, index: 0x0000, read_len: Some(2) },
    ControlStep { request: 0x9a, value: 0x0f2c, index: 0x0008, read_len: None },
    ControlStep { request: 0x9a, value: 0x2518, index: 0x00db, read_len: None },
    ControlStep { request: 0x95, value: 0x0706, index: 0x0000, read_len: Some(2) },
    ControlStep { request: 0x9a, value: 0x2727, index: 0x0000, read_len: None },
];
