//! Error types for battery test station operations.

use thiserror::Error;

/// Result type alias for station operations.
pub type Result<T> = std::result::Result<T, StationError>;

/// Error types for discharger and charger communication.
///
/// Routine link conditions are deliberately absent: a bulk read timeout
/// yields an empty frame set and a malformed frame is dropped, neither
/// is surfaced as an error.
#[derive(Error, Debug)]
pub enum StationError {
    /// USB transfer or device access error
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// General I/O error (covers the SocketCAN link)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The EBC-B20H was not found on the bus
    #[error("EBC-B20H discharger not found")]
    DeviceNotFound,

    /// `destroy()` requested while the poll loop is still running
    #[error("monitor loop still running; stop monitoring before destroy")]
    MonitorRunning,

    /// Malformed outbound frame parameters (e.g. an unrepresentable CAN ID)
    #[error("invalid frame: {0}")]
    Frame(String),

    /// Data parsing error (replay logs, status payloads)
    #[error("parse error: {0}")]
    Parse(String),
}
