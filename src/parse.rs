//! Decoders: provider frames into [`Sample`]s, and Muse Classic notification
//! payloads into provider frames.
//!
//! All functions here are pure and safe to call from any context.
//!
//! | Function | Input | Output |
//! |---|---|---|
//! | [`decode_sample`] | [`RawPacket`] | validated [`Sample`] |
//! | [`decode_eeg_samples`] | EEG payload | µV, 12-bit BE packed, 0.48828125 µV/LSB |
//! | [`decode_ppg_samples`] | PPG payload | raw 24-bit BE unsigned |
//! | [`parse_telemetry`] | telemetry notification | [`Telemetry`] |
//! | [`parse_accelerometer`] | accel notification | [`ImuReading`], 0.0000610352 g/LSB |
//! | [`parse_gyroscope`] | gyro notification | [`ImuReading`], 0.0074768 °/s/LSB |

use crate::error::SessionError;
use crate::protocol::StreamLayout;
use crate::types::{RawPacket, Sample, StreamType};

// ── Provider frame → Sample ───────────────────────────────────────────────────

/// Validate a provider frame against `layout` and turn it into a [`Sample`].
///
/// A frame is malformed when its stream label is unknown, its value count
/// differs from the layout's arity for that stream, or the timestamp or any
/// value is not finite.
pub fn decode_sample(packet: &RawPacket, layout: &StreamLayout) -> Result<Sample, SessionError> {
    let stream: StreamType = packet
        .stream
        .parse()
        .map_err(|_| SessionError::MalformedPacket(format!("unknown stream {:?}", packet.stream)))?;

    let expected = layout.channels(stream);
    if packet.values.len() != expected {
        return Err(SessionError::MalformedPacket(format!(
            "{stream} frame has {} channel(s), expected {expected}",
            packet.values.len()
        )));
    }
    if !packet.timestamp.is_finite() {
        return Err(SessionError::MalformedPacket(format!(
            "{stream} frame has non-finite timestamp"
        )));
    }
    if let Some(ch) = packet.values.iter().position(|v| !v.is_finite()) {
        return Err(SessionError::MalformedPacket(format!(
            "{stream} frame has non-finite value on channel {ch}"
        )));
    }

    Ok(Sample {
        values: packet.values.clone(),
        timestamp: packet.timestamp,
        stream,
    })
}

// ── EEG ──────────────────────────────────────────────────────────────────────

/// Decode a packed 12-bit unsigned array (big-endian, 3 bytes → 2 samples).
///
/// ```text
/// [AA BB CC] → sample0 = (AA << 4) | (BB >> 4)
///              sample1 = ((BB & 0x0F) << 8) | CC
/// ```
///
/// A trailing partial group yields whatever complete values it holds.
pub fn decode_unsigned_12bit(data: &[u8]) -> Vec<u16> {
    let mut out = Vec::with_capacity(data.len() * 2 / 3);
    for group in data.chunks(3) {
        if group.len() >= 2 {
            out.push(((group[0] as u16) << 4) | ((group[1] as u16) >> 4));
        }
        if group.len() == 3 {
            out.push((((group[1] as u16) & 0x0F) << 8) | (group[2] as u16));
        }
    }
    out
}

/// EEG payload (after the 2-byte packet index) into µV:
/// `µV = (raw − 2048) × 0.48828125`.
pub fn decode_eeg_samples(data: &[u8]) -> Vec<f64> {
    decode_unsigned_12bit(data)
        .into_iter()
        .map(|n| 0.48828125 * (n as f64 - 2048.0))
        .collect()
}

// ── PPG ──────────────────────────────────────────────────────────────────────

/// Decode a 24-bit unsigned big-endian array; partial trailing bytes are ignored.
pub fn decode_unsigned_24bit(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(3)
        .map(|c| ((c[0] as u32) << 16) | ((c[1] as u32) << 8) | (c[2] as u32))
        .collect()
}

/// PPG payload (after the 2-byte packet index) into raw ADC values.
pub fn decode_ppg_samples(data: &[u8]) -> Vec<f64> {
    decode_unsigned_24bit(data)
        .into_iter()
        .map(f64::from)
        .collect()
}

/// Split a per-channel notification into its big-endian packet index and payload.
pub fn split_index(data: &[u8]) -> Option<(u16, &[u8])> {
    match data {
        [hi, lo, rest @ ..] => Some((u16::from_be_bytes([*hi, *lo]), rest)),
        _ => None,
    }
}

// ── Telemetry ─────────────────────────────────────────────────────────────────

/// Battery and housekeeping values from one telemetry notification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Telemetry {
    pub sequence_id: u16,
    /// State of charge in percent.
    pub battery_level: f64,
    /// Fuel-gauge terminal voltage in millivolts.
    pub fuel_gauge_voltage: f64,
    /// Raw ADC temperature.
    pub temperature: u16,
}

/// Parse a telemetry notification (5 × big-endian `u16`):
///
/// | Bytes | Field | Conversion |
/// |---|---|---|
/// | 0–1 | sequence_id | raw |
/// | 2–3 | battery | ÷ 512 → % |
/// | 4–5 | fuel gauge | × 2.2 → mV |
/// | 6–7 | unused | — |
/// | 8–9 | temperature | raw |
///
/// Returns `None` if `data` is shorter than 10 bytes.
pub fn parse_telemetry(data: &[u8]) -> Option<Telemetry> {
    if data.len() < 10 {
        return None;
    }
    let be = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);
    Some(Telemetry {
        sequence_id: be(0),
        battery_level: be(2) as f64 / 512.0,
        fuel_gauge_voltage: be(4) as f64 * 2.2,
        temperature: be(8),
    })
}

// ── IMU ───────────────────────────────────────────────────────────────────────

/// Three consecutive XYZ samples from one accelerometer or gyroscope
/// notification; index 0 is the oldest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuReading {
    pub sequence_id: u16,
    pub samples: [[f64; 3]; 3],
}

/// Shared layout: 2-byte sequence id, then three XYZ triples of big-endian
/// `i16` at byte offsets 2, 8 and 14.  Needs 20 bytes.
fn parse_imu_reading(data: &[u8], scale: f64) -> Option<ImuReading> {
    if data.len() < 20 {
        return None;
    }
    let axis = |off: usize| scale * i16::from_be_bytes([data[off], data[off + 1]]) as f64;
    let xyz = |off: usize| [axis(off), axis(off + 2), axis(off + 4)];
    Some(ImuReading {
        sequence_id: u16::from_be_bytes([data[0], data[1]]),
        samples: [xyz(2), xyz(8), xyz(14)],
    })
}

/// ±2 G full scale over a 16-bit ADC.
pub fn parse_accelerometer(data: &[u8]) -> Option<ImuReading> {
    parse_imu_reading(data, 0.0000610352)
}

/// ±245 °/s full scale over a 16-bit ADC.
pub fn parse_gyroscope(data: &[u8]) -> Option<ImuReading> {
    parse_imu_reading(data, 0.0074768)
}
