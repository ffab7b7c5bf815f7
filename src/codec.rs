//! Wire codec for the EBC-B20H serial protocol.
//!
//! Conversion formulas from https://github.com/JOGAsoft/EBC-controller/blob/main/main.pas
//!
//! The device does not report values in the units it accepts them in:
//! the encode functions produce the scale the device expects in command
//! frames, the decode functions interpret the scale it uses in telemetry
//! frames. They are not inverses of each other and must not be "fixed"
//! to round-trip.

use crate::constants::*;

/// Byte offset of the status field in a telemetry frame
const OFFSET_STATUS: usize = 1;
/// Byte offset of the measured current (2 bytes)
const OFFSET_CURRENT: usize = 2;
/// Byte offset of the measured voltage (2 bytes)
const OFFSET_VOLTAGE: usize = 4;
/// Byte offset of the accumulated charge (2 bytes)
const OFFSET_MAH: usize = 6;

/// MSB value at which the telemetry voltage scale changes (the 30 V boundary)
const VOLTAGE_SCALE_BREAK: u8 = 149;

/// Raw threshold above which the device decimates accumulated charge
const MAH_DECIMATION_RAW: i32 = 10_000;

/// Fields decoded from one valid telemetry frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameData {
    pub status: u8,
    pub current: f64,
    pub voltage: f64,
    pub mah: i32,
}

/// XOR-fold checksum over a byte slice.
///
/// Signs outgoing command bodies and validates incoming frames.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |cs, b| cs ^ b)
}

/// Encode a current setpoint in amps into the two command-frame bytes.
pub fn encode_current(amps: f64) -> (u8, u8) {
    let raw = amps * 1000.0;
    let msb = (raw / 2400.0) as u8;
    let lsb = ((raw - f64::from(msb) * 2400.0) / 10.0) as u8;
    (msb, lsb)
}

/// Decode a telemetry current reading into amps.
pub fn decode_current(msb: u8, lsb: u8) -> f64 {
    f64::from(u16::from(msb) * 240 + u16::from(lsb)) / 100.0
}

/// Encode a voltage setpoint in volts into the two command-frame bytes.
pub fn encode_voltage(volts: f64) -> (u8, u8) {
    let raw = volts * 1000.0;
    let msb = (raw / 2400.0) as u8;
    let lsb = ((raw - f64::from(msb) * 2400.0) / 10.0) as u8;
    (msb, lsb)
}

/// Decode a telemetry voltage reading into volts.
///
/// The device switches scale at `msb == 149` (about 30 V); both branches
/// match observed frames and the discontinuity is intentional.
pub fn decode_voltage(msb: u8, lsb: u8) -> f64 {
    if msb < VOLTAGE_SCALE_BREAK {
        f64::from(u16::from(msb) * 240 + u16::from(lsb)) / 1000.0
    } else {
        f64::from(2992 + u16::from(msb - VOLTAGE_SCALE_BREAK) * 240 + u16::from(lsb)) / 100.0
    }
}

/// Encode an accumulated charge value in mAh.
///
/// Above 10 Ah the device decimates by ten, so the encoding is lossy:
/// round trips are only exact to within ±5 mAh up there.
pub fn encode_mah(value: u32) -> (u8, u8) {
    let raw = if value < MAH_DECIMATION_RAW as u32 {
        value
    } else {
        32_768 + (f64::from(value) / 10.0).round() as u32
    };
    ((raw / 240) as u8, (raw % 240) as u8)
}

/// Decode an accumulated charge reading into mAh.
pub fn decode_mah(msb: u8, lsb: u8) -> i32 {
    let raw = i32::from(msb) * 240 + i32::from(lsb);
    if raw >= MAH_DECIMATION_RAW {
        (raw - 32_768) * 10
    } else {
        raw
    }
}

/// Check length and checksum of a candidate telemetry frame.
pub fn is_frame_valid(frame: &[u8]) -> bool {
    if frame.len() != FRAME_LEN {
        return false;
    }
    checksum(&frame[1..frame.len() - 2]) == frame[frame.len() - 2]
}

/// Decode the fields of a telemetry frame.
///
/// The frame must have passed [`is_frame_valid`] first.
pub fn decode_frame(frame: &[u8]) -> FrameData {
    FrameData {
        status: frame[OFFSET_STATUS],
        current: decode_current(frame[OFFSET_CURRENT], frame[OFFSET_CURRENT + 1]),
        voltage: decode_voltage(frame[OFFSET_VOLTAGE], frame[OFFSET_VOLTAGE + 1]),
        mah: decode_mah(frame[OFFSET_MAH], frame[OFFSET_MAH + 1]),
    }
}

/// Wrap a command body with the frame markers and its checksum.
pub fn frame_command(body: &[u8; CMD_BODY_LEN]) -> [u8; CMD_BODY_LEN + 3] {
    let mut frame = [0u8; CMD_BODY_LEN + 3];
    frame[0] = FRAME_START;
    frame[1..1 + CMD_BODY_LEN].copy_from_slice(body);
    frame[1 + CMD_BODY_LEN] = checksum(body);
    frame[2 + CMD_BODY_LEN] = FRAME_END;
    frame
}

/// Splits a raw byte stream into candidate frames.
///
/// USB reads may split or merge device messages, so an in-progress line
/// is carried over between feeds. A start marker flushes any line in
/// progress (possibly truncated) as a candidate; an end marker closes
/// and emits the current line. Candidates still have to pass
/// [`is_frame_valid`].
#[derive(Debug, Default)]
pub struct FrameReader {
    line: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning zero or more candidate frames.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &b in data {
            match b {
                FRAME_START => {
                    // Start of new message
                    if !self.line.is_empty() {
                        frames.push(std::mem::take(&mut self.line));
                    }
                    self.line.push(b);
                }
                FRAME_END => {
                    self.line.push(b);
                    frames.push(std::mem::take(&mut self.line));
                }
                _ => self.line.push(b),
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_vectors() {
        let cases: &[(&[u8], u8)] = &[
            (&[0x01, 0, 0x32, 0x0C, 0x78, 0, 0], 0x47),
            (&[0x01, 0, 0x32, 0x0D, 0x50, 0, 0], 0x6E),
            (&[0x01, 0, 0x64, 0x0C, 0x78, 0, 0], 0x11),
            (&[0x01, 0, 0x64, 0x03, 0x50, 0, 0], 0x36),
        ];
        for (body, expected) in cases {
            assert_eq!(checksum(body), *expected);
        }
    }

    #[test]
    fn encode_voltage_vectors() {
        let cases = [
            (30.0, (0x0C, 0x78)),
            (32.0, (0x0D, 0x50)),
            (8.0, (0x03, 0x50)),
            (2.0, (0x00, 0xC8)),
        ];
        for (volts, expected) in cases {
            assert_eq!(encode_voltage(volts), expected);
        }
    }

    #[test]
    fn encode_current_vectors() {
        let cases = [
            (0.1, (0x00, 0x0A)),
            (0.11, (0x00, 0x0B)),
            (0.5, (0x00, 0x32)),
            (12.0, (0x05, 0x00)),
        ];
        for (amps, expected) in cases {
            assert_eq!(encode_current(amps), expected);
        }
    }

    #[test]
    fn decode_voltage_is_piecewise() {
        assert_eq!(decode_voltage(67, 160), 16.24);
        // scale discontinuity at msb 149
        assert_eq!(decode_voltage(148, 239), 35.759);
        assert_eq!(decode_voltage(149, 0), 29.92);
        assert_eq!(decode_voltage(155, 0), 44.32);
    }

    #[test]
    fn decode_current_uses_device_scale() {
        assert_eq!(decode_current(0, 50), 0.5);
        assert_eq!(decode_current(4, 40), 10.0);
    }

    #[test]
    fn mah_round_trip_exact_below_decimation() {
        for value in 0..10_000u32 {
            let (msb, lsb) = encode_mah(value);
            assert_eq!(decode_mah(msb, lsb), value as i32);
        }
    }

    #[test]
    fn mah_round_trip_within_five_above_decimation() {
        for value in 10_000..50_000u32 {
            let (msb, lsb) = encode_mah(value);
            let diff = (decode_mah(msb, lsb) - value as i32).abs();
            assert!(diff <= 5, "value {} decoded {} off", value, diff);
        }
    }

    fn valid_frame() -> Vec<u8> {
        let mut frame = vec![0u8; FRAME_LEN];
        frame[0] = FRAME_START;
        frame[OFFSET_STATUS] = STATUS_DISCHARGING;
        frame[OFFSET_CURRENT] = 0;
        frame[OFFSET_CURRENT + 1] = 50;
        frame[OFFSET_VOLTAGE] = 67;
        frame[OFFSET_VOLTAGE + 1] = 160;
        frame[OFFSET_MAH] = 4;
        frame[OFFSET_MAH + 1] = 40;
        frame[FRAME_LEN - 2] = checksum(&frame[1..FRAME_LEN - 2]);
        frame[FRAME_LEN - 1] = FRAME_END;
        frame
    }

    #[test]
    fn frame_validity() {
        let frame = valid_frame();
        assert!(is_frame_valid(&frame));

        // wrong length
        assert!(!is_frame_valid(&frame[..FRAME_LEN - 1]));
        assert!(!is_frame_valid(&[]));

        // corrupted interior byte
        let mut bad = frame.clone();
        bad[OFFSET_VOLTAGE] ^= 0x10;
        assert!(!is_frame_valid(&bad));

        // corrupted checksum byte
        let mut bad = frame;
        bad[FRAME_LEN - 2] ^= 0x01;
        assert!(!is_frame_valid(&bad));
    }

    #[test]
    fn frame_field_offsets() {
        let data = decode_frame(&valid_frame());
        assert_eq!(data.status, STATUS_DISCHARGING);
        assert_eq!(data.current, 0.5);
        assert_eq!(data.voltage, 16.24);
        assert_eq!(data.mah, 1000);
    }

    #[test]
    fn command_framing_matches_captures() {
        // connect and discharge frames as captured from the official software
        assert_eq!(
            frame_command(&[CMD_CONNECT, 0, 0, 0, 0, 0, 0]),
            [0xFA, 0x05, 0, 0, 0, 0, 0, 0, 0x05, 0xF8]
        );
        assert_eq!(
            frame_command(&[CMD_DISCHARGE, 0, 0x32, 0x0C, 0x78, 0, 0]),
            [0xFA, 0x01, 0, 0x32, 0x0C, 0x78, 0, 0, 0x47, 0xF8]
        );
    }

    #[test]
    fn reader_reassembles_split_reads() {
        let frame = valid_frame();
        let mut reader = FrameReader::new();

        // frame split across two reads
        assert!(reader.feed(&frame[..7]).is_empty());
        let frames = reader.feed(&frame[7..]);
        assert_eq!(frames, vec![frame.clone()]);

        // two frames merged into one read
        let mut merged = frame.clone();
        merged.extend_from_slice(&frame);
        assert_eq!(reader.feed(&merged), vec![frame.clone(), frame]);
    }

    #[test]
    fn reader_flushes_truncated_line_on_new_start() {
        let mut reader = FrameReader::new();
        assert!(reader.feed(&[FRAME_START, 0x0A, 0x01]).is_empty());

        // device restarted mid-message: truncated candidate is flushed,
        // rejected later by the validity check
        let frames = reader.feed(&valid_frame());
        assert_eq!(frames.len(), 2);
        assert!(!is_frame_valid(&frames[0]));
        assert!(is_frame_valid(&frames[1]));
    }

    #[test]
    fn reader_returns_nothing_on_empty_read() {
        let mut reader = FrameReader::new();
        assert!(reader.feed(&[]).is_empty());
    }
}
