//! Timestamp reconstruction and channel alignment for per-channel
//! notification streams.
//!
//! Classic Muse firmware sends one notification per electrode, each carrying
//! a 16-bit packet index and a burst of samples for that electrode alone.  A
//! [`Sample`](crate::types::Sample) needs one value per channel at one
//! instant, so the BLE provider runs every burst through a
//! [`ChannelAligner`], which waits until all channels of a packet index have
//! arrived and then emits one [`RawPacket`] per sample position.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::types::RawPacket;

/// Incomplete packet indices kept before the oldest one is given up on.
const MAX_PENDING: usize = 8;

pub(crate) fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
        * 1000.0
}

// ── TimestampTracker ──────────────────────────────────────────────────────────

/// Reconstructs a wall-clock timestamp for each notification from the
/// device's monotonic packet index.
///
/// The headset does not embed absolute time.  The first packet is anchored to
/// `now − reading_duration` (the start of its window), and later packets are
/// extrapolated from the index delta and the sample rate, so BLE jitter does
/// not skew inter-packet spacing.
///
/// One tracker per logical channel, reset on reconnect.
#[derive(Debug, Clone, Default)]
pub struct TimestampTracker {
    anchor: Option<(u16, f64)>,
}

impl TimestampTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamp (ms) of the first sample of the packet `event_index`.
    pub fn get(&mut self, event_index: u16, samples_per_reading: usize, frequency: f64) -> f64 {
        self.get_at(event_index, samples_per_reading, frequency, now_ms())
    }

    /// [`get`](Self::get) with an explicit clock reading, for deterministic use.
    pub fn get_at(
        &mut self,
        event_index: u16,
        samples_per_reading: usize,
        frequency: f64,
        now: f64,
    ) -> f64 {
        let reading_delta = 1000.0 * samples_per_reading as f64 / frequency;
        let (last_index, last_ts) = *self
            .anchor
            .get_or_insert((event_index, now - reading_delta));

        let last = last_index as i32;
        let mut idx = event_index as i32;
        // 16-bit wrap: a large backward jump means the counter rolled over.
        while last - idx > 0x1000 {
            idx += 0x10000;
        }

        if idx > last {
            let ts = last_ts + reading_delta * (idx - last) as f64;
            self.anchor = Some((event_index, ts));
            ts
        } else {
            // Duplicate or late packet: back-date without moving the anchor.
            last_ts - reading_delta * (last - idx) as f64
        }
    }

    pub fn reset(&mut self) {
        self.anchor = None;
    }
}

// ── ChannelAligner ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PendingFrame {
    timestamp: f64,
    channels: Vec<Option<Vec<f64>>>,
}

/// Zips per-channel bursts sharing a packet index into multi-channel frames.
#[derive(Debug)]
pub struct ChannelAligner {
    stream: &'static str,
    channels: usize,
    sample_period_ms: f64,
    pending: BTreeMap<u16, PendingFrame>,
}

impl ChannelAligner {
    /// `stream` is the label stamped on emitted frames, `frequency` the
    /// per-channel sample rate used to space samples within a burst.
    pub fn new(stream: &'static str, channels: usize, frequency: f64) -> Self {
        Self {
            stream,
            channels,
            sample_period_ms: 1000.0 / frequency,
            pending: BTreeMap::new(),
        }
    }

    /// Add one channel's burst.  Returns the frames of `index` once every
    /// channel has contributed, oldest first; otherwise an empty vec.
    pub fn push(&mut self, channel: usize, index: u16, timestamp: f64, samples: Vec<f64>) -> Vec<RawPacket> {
        if channel >= self.channels {
            debug!("{}: ignoring burst for channel {channel}", self.stream);
            return Vec::new();
        }

        let channels = self.channels;
        let frame = self.pending.entry(index).or_insert_with(|| PendingFrame {
            timestamp,
            channels: vec![None; channels],
        });
        frame.channels[channel] = Some(samples);

        if frame.channels.iter().all(Option::is_some) {
            return match self.pending.remove(&index) {
                Some(frame) => self.emit(frame),
                None => Vec::new(),
            };
        }

        while self.pending.len() > MAX_PENDING {
            if let Some((stale, _)) = self.pending.pop_first() {
                debug!("{}: dropping incomplete packet {stale}", self.stream);
            }
        }
        Vec::new()
    }

    fn emit(&self, frame: PendingFrame) -> Vec<RawPacket> {
        let bursts: Vec<Vec<f64>> = frame.channels.into_iter().flatten().collect();
        // Channels can disagree on burst length; only full columns are emitted.
        let depth = bursts.iter().map(Vec::len).min().unwrap_or(0);
        (0..depth)
            .map(|i| {
                RawPacket::new(
                    self.stream,
                    frame.timestamp + i as f64 * self.sample_period_ms,
                    bursts.iter().map(|b| b[i]).collect(),
                )
            })
            .collect()
    }

    /// Forget all partial frames (on reconnect or stream restart).
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}
