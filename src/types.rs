//! Value types shared by the session, the dispatcher and every provider.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::SessionError;

// ── DeviceRecord ──────────────────────────────────────────────────────────────

/// A headset seen during discovery.
///
/// Records are immutable once created.  Two records describe the same device
/// when their `address` matches, regardless of the advertised name (names
/// can change between advertisements, addresses cannot).
#[derive(Debug, Clone, Eq)]
pub struct DeviceRecord {
    /// Advertised device name (e.g. `"Muse-AB12"`).
    pub name: String,
    /// Platform link identifier.
    /// • macOS / Windows: a UUID string
    /// • Linux: a Bluetooth MAC address (`AA:BB:CC:DD:EE:FF`)
    pub address: String,
}

impl DeviceRecord {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// Best-effort hardware model guess from the advertised name.
    pub fn model(&self) -> DeviceModel {
        DeviceModel::from_name(&self.name)
    }
}

impl PartialEq for DeviceRecord {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Hash for DeviceRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.address)
    }
}

/// Headset generation, inferred from the advertised name.
///
/// | Model | Matches (case-insensitive) | Label |
/// |---|---|---|
/// | `MuseS` | `muse s`, `muse-s` | `muse_s_athena` |
/// | `Muse2` | `muse 2`, `muse-2` | `muse_2` |
/// | `Muse2016` | anything else | `muse_2016` |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceModel {
    MuseS,
    Muse2,
    Muse2016,
}

impl DeviceModel {
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.contains("muse s") || lower.contains("muse-s") {
            DeviceModel::MuseS
        } else if lower.contains("muse 2") || lower.contains("muse-2") {
            DeviceModel::Muse2
        } else {
            DeviceModel::Muse2016
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DeviceModel::MuseS => "muse_s_athena",
            DeviceModel::Muse2 => "muse_2",
            DeviceModel::Muse2016 => "muse_2016",
        }
    }
}

// ── ConnectionState ───────────────────────────────────────────────────────────

/// Lifecycle state of a session.
///
/// ```text
/// Idle ──▶ Scanning ──▶ Connecting ──▶ Connected ◀──▶ Streaming
///                           │              │              │
///                           ▼              ▼              ▼
///                         Failed      Disconnecting ──▶ Disconnected
/// ```
///
/// `Disconnected` and `Failed` lead back to `Scanning` (or `Idle` via
/// `reset`).  Only the session worker ever changes the live state.  The
/// string label of each variant is stable and safe to show or persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Streaming,
    Disconnecting,
    Disconnected,
    Failed,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 8] = [
        ConnectionState::Idle,
        ConnectionState::Scanning,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Streaming,
        ConnectionState::Disconnecting,
        ConnectionState::Disconnected,
        ConnectionState::Failed,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Scanning => "scanning",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        }
    }

    /// `true` while a radio link to a device exists or is being negotiated.
    pub fn has_link(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Streaming
                | ConnectionState::Disconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ConnectionState {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConnectionState::ALL
            .into_iter()
            .find(|state| state.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SessionError::UnknownLabel(s.to_owned()))
    }
}

// ── StreamType ────────────────────────────────────────────────────────────────

/// Kind of data carried by a [`Sample`].
///
/// | Variant | Label | Default arity |
/// |---|---|---|
/// | `Eeg` | `EEG` | 4 (5 with AUX) |
/// | `Accelerometer` | `ACC` | 3 |
/// | `Gyroscope` | `GYRO` | 3 |
/// | `Ppg` | `PPG` | 3 |
/// | `Battery` | `BATTERY` | 1 |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Eeg,
    Accelerometer,
    Gyroscope,
    Ppg,
    Battery,
}

impl StreamType {
    pub const ALL: [StreamType; 5] = [
        StreamType::Eeg,
        StreamType::Accelerometer,
        StreamType::Gyroscope,
        StreamType::Ppg,
        StreamType::Battery,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            StreamType::Eeg => "EEG",
            StreamType::Accelerometer => "ACC",
            StreamType::Gyroscope => "GYRO",
            StreamType::Ppg => "PPG",
            StreamType::Battery => "BATTERY",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for StreamType {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StreamType::ALL
            .into_iter()
            .find(|stream| stream.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SessionError::UnknownLabel(s.to_owned()))
    }
}

// ── Samples ───────────────────────────────────────────────────────────────────

/// A frame as handed over by the radio link provider, before validation.
///
/// The stream label is free-form text from the transport (`"EEG"`, `"ACC"`,
/// …).  [`crate::parse::decode_sample`] turns it into a typed [`Sample`].
#[derive(Debug, Clone, PartialEq)]
pub struct RawPacket {
    pub stream: String,
    /// Milliseconds; the provider decides whether this is wall-clock or monotonic.
    pub timestamp: f64,
    pub values: Vec<f64>,
}

impl RawPacket {
    pub fn new(stream: impl Into<String>, timestamp: f64, values: Vec<f64>) -> Self {
        Self {
            stream: stream.into(),
            timestamp,
            values,
        }
    }
}

/// One decoded, timestamped reading across all channels of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// One value per channel, in the stream's channel order
    /// (EEG: `[TP9, AF7, AF8, TP10(, AUX)]`, IMU: `[x, y, z]`).
    pub values: Vec<f64>,
    /// Milliseconds, copied from the provider frame.
    pub timestamp: f64,
    pub stream: StreamType,
}

// ── State changes ─────────────────────────────────────────────────────────────

/// Why a transition happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionReason {
    /// A caller command.
    Requested,
    /// The link dropped without being asked to (power-off, out of range).
    Unexpected,
    /// The connect attempt got no answer within the configured timeout.
    Timeout,
    /// The provider reported an error.
    ProviderError(String),
    /// Teardown was not confirmed within the grace period; forced.
    GraceElapsed,
    /// A scan ran for its configured duration without being stopped.
    ScanTimeout,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionReason::Requested => f.write_str("requested"),
            TransitionReason::Unexpected => f.write_str("unexpected"),
            TransitionReason::Timeout => f.write_str("timeout"),
            TransitionReason::ProviderError(msg) => write!(f, "provider error: {msg}"),
            TransitionReason::GraceElapsed => f.write_str("grace period elapsed"),
            TransitionReason::ScanTimeout => f.write_str("scan timeout"),
        }
    }
}

/// A committed transition, as observed by connection listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub previous: ConnectionState,
    pub state: ConnectionState,
    /// The device the session is (or was last) bound to.
    pub device: Option<DeviceRecord>,
    pub reason: Option<TransitionReason>,
}

impl StateChange {
    /// `true` for a link that dropped without a caller request.
    pub fn is_unexpected(&self) -> bool {
        self.reason == Some(TransitionReason::Unexpected)
    }

    /// The failure this transition reports, if any.
    ///
    /// `timeout` is only used to fill in [`SessionError::ConnectionTimeout`].
    pub fn error(&self, timeout: std::time::Duration) -> Option<SessionError> {
        let address = self
            .device
            .as_ref()
            .map(|d| d.address.clone())
            .unwrap_or_default();
        match (&self.state, &self.reason) {
            (ConnectionState::Failed, Some(TransitionReason::Timeout)) => {
                Some(SessionError::ConnectionTimeout { address, timeout })
            }
            (ConnectionState::Failed, Some(TransitionReason::ProviderError(reason))) => {
                Some(SessionError::ConnectionFailed {
                    address,
                    reason: reason.clone(),
                })
            }
            (ConnectionState::Failed, _) => Some(SessionError::ConnectionFailed {
                address,
                reason: "unknown".into(),
            }),
            (ConnectionState::Disconnected, Some(TransitionReason::Unexpected)) => {
                Some(SessionError::UnexpectedDisconnect { address })
            }
            _ => None,
        }
    }
}
