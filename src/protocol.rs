//! Stream layout, sampling constants, and Muse BLE wire-format helpers.
//!
//! The GATT UUIDs belong to the Muse vendor namespace
//! `273eXXXX-4c4d-454d-96be-f03bac821358` and are only compiled with the
//! `ble` feature; everything else here is transport-independent.

use crate::types::StreamType;

// ── Stream layout ─────────────────────────────────────────────────────────────

/// Expected number of channels per stream type.
///
/// The dispatcher rejects any frame whose value count does not match the
/// entry for its declared stream; see [`crate::parse::decode_sample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLayout {
    pub eeg: usize,
    pub accelerometer: usize,
    pub gyroscope: usize,
    pub ppg: usize,
    pub battery: usize,
}

impl StreamLayout {
    /// Layout for a Classic headset, with or without the AUX electrode.
    pub fn classic(enable_aux: bool) -> Self {
        Self {
            eeg: if enable_aux { 5 } else { 4 },
            ..Self::default()
        }
    }

    pub fn channels(&self, stream: StreamType) -> usize {
        match stream {
            StreamType::Eeg => self.eeg,
            StreamType::Accelerometer => self.accelerometer,
            StreamType::Gyroscope => self.gyroscope,
            StreamType::Ppg => self.ppg,
            StreamType::Battery => self.battery,
        }
    }
}

impl Default for StreamLayout {
    fn default() -> Self {
        Self {
            eeg: 4,
            accelerometer: 3,
            gyroscope: 3,
            ppg: PPG_CHANNEL_NAMES.len(),
            battery: 1,
        }
    }
}

// ── Sampling constants ────────────────────────────────────────────────────────

/// EEG sample rate in Hz (per channel).
pub const EEG_FREQUENCY: f64 = 256.0;

/// EEG values per channel in one Classic notification (≈ 46.9 ms at 256 Hz).
pub const EEG_SAMPLES_PER_READING: usize = 12;

/// PPG sample rate in Hz (per optical channel).
pub const PPG_FREQUENCY: f64 = 64.0;

/// Raw 24-bit PPG values in one notification (≈ 93.75 ms at 64 Hz).
pub const PPG_SAMPLES_PER_READING: usize = 6;

/// Accelerometer / gyroscope rate in Hz.
pub const IMU_FREQUENCY: f64 = 52.0;

/// XYZ triples in one IMU notification.
pub const IMU_SAMPLES_PER_READING: usize = 3;

// ── Human-readable labels ─────────────────────────────────────────────────────

/// Electrode names in EEG channel order.  `"AUX"` only with `enable_aux`.
pub const EEG_CHANNEL_NAMES: [&str; 5] = ["TP9", "AF7", "AF8", "TP10", "AUX"];

/// Optical channel names in PPG channel order.
pub const PPG_CHANNEL_NAMES: [&str; 3] = ["ambient", "infrared", "red"];

// ── Stream control ────────────────────────────────────────────────────────────

/// Control commands that bring a Classic headset into streaming mode.
///
/// `h` (halt) → `s` (status) → *preset* → `d` (data on):
///
/// | `enable_ppg` | `enable_aux` | Preset |
/// |---|---|---|
/// | false | false | `p21` (EEG only) |
/// | false | true  | `p20` (EEG + AUX) |
/// | true  | —     | `p50` (EEG + PPG) |
pub fn start_sequence(enable_aux: bool, enable_ppg: bool) -> [&'static str; 4] {
    let preset = if enable_ppg {
        "p50"
    } else if enable_aux {
        "p20"
    } else {
        "p21"
    };
    ["h", "s", preset, "d"]
}

/// Halts the data stream without dropping the link.
pub const STOP_COMMAND: &str = "h";

/// Encode a text command for the Muse control characteristic.
///
/// ```text
/// byte 0     : payload length (= command.len() + 1 for the trailing '\n')
/// bytes 1..N : ASCII command string
/// byte N+1   : '\n' terminator
/// ```
///
/// ```
/// # use headband_session::protocol::encode_command;
/// assert_eq!(encode_command("d"), &[0x02, b'd', b'\n']);
/// ```
pub fn encode_command(cmd: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(cmd.len() + 2);
    bytes.push((cmd.len() + 1) as u8);
    bytes.extend_from_slice(cmd.as_bytes());
    bytes.push(b'\n');
    bytes
}

/// Decode one control-characteristic notification into its text fragment.
///
/// Same length-prefix framing as [`encode_command`]; the length byte is
/// clamped to what was actually received.
pub fn decode_response(bytes: &[u8]) -> String {
    let Some((&len, rest)) = bytes.split_first() else {
        return String::new();
    };
    let end = (len as usize).min(rest.len());
    String::from_utf8_lossy(&rest[..end]).into_owned()
}

// ── GATT identifiers ──────────────────────────────────────────────────────────

#[cfg(feature = "ble")]
pub use gatt::*;

#[cfg(feature = "ble")]
mod gatt {
    use uuid::Uuid;

    /// Primary service advertised by every Muse headset.
    pub const MUSE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fe8d_0000_1000_8000_00805f9b34fb);

    /// Bidirectional control channel (length-prefixed ASCII commands out,
    /// JSON fragments back).
    pub const CONTROL_CHARACTERISTIC: Uuid =
        Uuid::from_u128(0x273e0001_4c4d_454d_96be_f03bac821358);

    /// Battery / fuel gauge / temperature, roughly once per second.
    pub const TELEMETRY_CHARACTERISTIC: Uuid =
        Uuid::from_u128(0x273e000b_4c4d_454d_96be_f03bac821358);

    pub const GYROSCOPE_CHARACTERISTIC: Uuid =
        Uuid::from_u128(0x273e0009_4c4d_454d_96be_f03bac821358);

    pub const ACCELEROMETER_CHARACTERISTIC: Uuid =
        Uuid::from_u128(0x273e000a_4c4d_454d_96be_f03bac821358);

    /// One characteristic per electrode, in [`super::EEG_CHANNEL_NAMES`] order.
    pub const EEG_CHARACTERISTICS: [Uuid; 5] = [
        Uuid::from_u128(0x273e0003_4c4d_454d_96be_f03bac821358), // TP9
        Uuid::from_u128(0x273e0004_4c4d_454d_96be_f03bac821358), // AF7
        Uuid::from_u128(0x273e0005_4c4d_454d_96be_f03bac821358), // AF8
        Uuid::from_u128(0x273e0006_4c4d_454d_96be_f03bac821358), // TP10
        Uuid::from_u128(0x273e0007_4c4d_454d_96be_f03bac821358), // AUX
    ];

    /// One characteristic per optical channel, in [`super::PPG_CHANNEL_NAMES`] order.
    pub const PPG_CHARACTERISTICS: [Uuid; 3] = [
        Uuid::from_u128(0x273e000f_4c4d_454d_96be_f03bac821358), // ambient
        Uuid::from_u128(0x273e0010_4c4d_454d_96be_f03bac821358), // infrared
        Uuid::from_u128(0x273e0011_4c4d_454d_96be_f03bac821358), // red
    ];
}
