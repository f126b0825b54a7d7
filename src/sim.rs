//! In-process headset simulator, for running without hardware.
//!
//! [`SimulatedProvider`] advertises the configured devices, accepts a
//! connection after a short delay, and while streaming emits synthetic EEG at
//! the real headset cadence (12 rows every 12 / 256 Hz ≈ 46.9 ms), PPG when
//! enabled, and IMU plus battery roughly once per second.

use std::f64::consts::PI;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::align::now_ms;
use crate::protocol::{EEG_FREQUENCY, EEG_SAMPLES_PER_READING, PPG_CHANNEL_NAMES};
use crate::provider::{LinkState, ProviderEventSink, RadioLinkProvider, StreamCommand};
use crate::types::{DeviceRecord, RawPacket, StreamType};

/// Configuration for [`SimulatedProvider`].
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Devices advertised during discovery, in order.
    pub devices: Vec<DeviceRecord>,
    /// Delay before each advertisement.  Default: 200 ms.
    pub advertise_delay: Duration,
    /// Time a connect takes to succeed.  Default: 500 ms.
    pub connect_delay: Duration,
    /// When `false`, connects never complete (exercises connect timeouts).
    pub reachable: bool,
    /// EEG packets between IMU / battery updates.  Default: 21 (≈ 984 ms).
    pub slow_stream_every: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            devices: vec![DeviceRecord::new("Muse-SIM0", "00:55:AA:00:00:01")],
            advertise_delay: Duration::from_millis(200),
            connect_delay: Duration::from_millis(500),
            reachable: true,
            slow_stream_every: 21,
        }
    }
}

#[derive(Default)]
struct SimState {
    sink: Option<ProviderEventSink>,
    linked: Option<String>,
    discovery: Option<AbortHandle>,
    stream: Option<AbortHandle>,
}

/// A [`RadioLinkProvider`] backed by a signal generator.
pub struct SimulatedProvider {
    config: SimConfig,
    state: Mutex<SimState>,
}

impl SimulatedProvider {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Simulate the headset going away (powered off, out of range): stop
    /// streaming and report the link as down.
    pub fn drop_link(&self) {
        let mut state = self.state.lock();
        if let Some(stream) = state.stream.take() {
            stream.abort();
        }
        if let (Some(address), Some(sink)) = (state.linked.take(), state.sink.as_ref()) {
            info!("sim: {address} dropped the link");
            sink.link_state(address, LinkState::Disconnected);
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().stream.is_some()
    }

    fn sink(&self) -> Result<ProviderEventSink> {
        self.state
            .lock()
            .sink
            .clone()
            .ok_or_else(|| anyhow!("simulator is not attached to a session"))
    }

    fn stop_stream(&self) {
        if let Some(stream) = self.state.lock().stream.take() {
            stream.abort();
        }
    }
}

#[async_trait]
impl RadioLinkProvider for SimulatedProvider {
    fn attach(&self, events: ProviderEventSink) {
        self.state.lock().sink = Some(events);
    }

    async fn begin_discovery(&self) -> Result<()> {
        let sink = self.sink()?;
        let devices = self.config.devices.clone();
        let delay = self.config.advertise_delay;
        let task = tokio::spawn(async move {
            for device in devices {
                tokio::time::sleep(delay).await;
                debug!("sim: advertising {device}");
                if !sink.discovered(device) {
                    break;
                }
            }
        });
        if let Some(previous) = self.state.lock().discovery.replace(task.abort_handle()) {
            previous.abort();
        }
        Ok(())
    }

    async fn end_discovery(&self) -> Result<()> {
        if let Some(discovery) = self.state.lock().discovery.take() {
            discovery.abort();
        }
        Ok(())
    }

    async fn connect(&self, address: &str, _timeout: Duration) -> Result<()> {
        if !self.config.devices.iter().any(|d| d.address == address) {
            return Err(anyhow!("no simulated device at {address}"));
        }
        if !self.config.reachable {
            // The session's own timeout ends this.
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.config.connect_delay).await;
        self.state.lock().linked = Some(address.to_owned());
        info!("sim: connected to {address}");
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        self.stop_stream();
        let mut state = self.state.lock();
        if state.linked.as_deref() == Some(address) {
            state.linked = None;
        }
        info!("sim: disconnected from {address}");
        Ok(())
    }

    async fn send(&self, command: StreamCommand) -> Result<()> {
        match command {
            StreamCommand::Start {
                enable_aux,
                enable_ppg,
            } => {
                let sink = self.sink()?;
                let mut state = self.state.lock();
                let address = state
                    .linked
                    .clone()
                    .ok_or_else(|| anyhow!("simulator is not connected"))?;
                let generator = Generator {
                    sink,
                    address,
                    eeg_channels: if enable_aux { 5 } else { 4 },
                    enable_ppg,
                    slow_every: self.config.slow_stream_every.max(1),
                };
                let task = tokio::spawn(generator.run());
                if let Some(previous) = state.stream.replace(task.abort_handle()) {
                    previous.abort();
                }
                Ok(())
            }
            StreamCommand::Stop => {
                self.stop_stream();
                Ok(())
            }
        }
    }
}

// ── Signal generation ─────────────────────────────────────────────────────────

/// Synthetic EEG at time `t` (seconds) for channel `ch`.
///
/// | Component | Frequency | Amplitude |
/// |-----------|-----------|-----------|
/// | Alpha     | 10 Hz     | ±20 µV, phase-shifted per channel |
/// | Beta      | 22 Hz     | ±6 µV     |
/// | Theta     | 6 Hz      | ±10 µV    |
/// | Noise     | —         | ±4 µV, deterministic in (t, ch) |
pub fn eeg_signal(t: f64, ch: usize) -> f64 {
    let phi = ch as f64 * PI / 2.5;
    let alpha = 20.0 * (2.0 * PI * 10.0 * t + phi).sin();
    let beta = 6.0 * (2.0 * PI * 22.0 * t + phi * 1.7).sin();
    let theta = 10.0 * (2.0 * PI * 6.0 * t + phi * 0.9).sin();
    let nx = t * 1000.7 + ch as f64 * 137.508;
    let noise = ((nx.sin() * 9973.1).fract() - 0.5) * 8.0;
    alpha + beta + theta + noise
}

struct Generator {
    sink: ProviderEventSink,
    address: String,
    eeg_channels: usize,
    enable_ppg: bool,
    slow_every: u32,
}

impl Generator {
    fn emit(&self, stream: StreamType, timestamp: f64, values: Vec<f64>) -> bool {
        self.sink
            .packet(self.address.as_str(), RawPacket::new(stream.label(), timestamp, values))
    }

    async fn run(self) {
        let dt = 1.0 / EEG_FREQUENCY;
        let rows = EEG_SAMPLES_PER_READING;
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(rows as f64 * dt));
        let started = now_ms();
        let mut t = 0.0_f64;
        let mut tick = 0u32;

        loop {
            ticker.tick().await;
            let base = started + t * 1000.0;

            for i in 0..rows {
                let ts = t + i as f64 * dt;
                let values = (0..self.eeg_channels).map(|ch| eeg_signal(ts, ch)).collect();
                if !self.emit(StreamType::Eeg, base + i as f64 * dt * 1000.0, values) {
                    return;
                }
            }

            if self.enable_ppg {
                // 64 Hz optical: a quarter of the EEG rows.
                for i in (0..rows).step_by(4) {
                    let ts = t + i as f64 * dt;
                    let pulse = (2.0 * PI * 1.2 * ts).sin();
                    let values = (0..PPG_CHANNEL_NAMES.len())
                        .map(|ch| 100_000.0 + (ch as f64 + 1.0) * 5_000.0 * pulse)
                        .collect();
                    self.emit(StreamType::Ppg, base + i as f64 * dt * 1000.0, values);
                }
            }

            tick = tick.wrapping_add(1);
            if tick % self.slow_every == 0 {
                self.emit(
                    StreamType::Accelerometer,
                    base,
                    vec![
                        0.01 * (2.0 * PI * 0.3 * t).sin(),
                        0.02 * (2.0 * PI * 0.5 * t).cos(),
                        -1.0 + 0.005 * (2.0 * PI * 0.1 * t).sin(),
                    ],
                );
                self.emit(
                    StreamType::Gyroscope,
                    base,
                    vec![
                        0.12 * (2.0 * PI * 0.2 * t).sin(),
                        0.08 * (2.0 * PI * 0.3 * t).cos(),
                        0.05 * (2.0 * PI * 0.1 * t).sin(),
                    ],
                );
                self.emit(
                    StreamType::Battery,
                    base,
                    vec![(85.0 - t / 300.0).clamp(0.0, 100.0)],
                );
            }
            t += rows as f64 * dt;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderEvent;

    fn fast() -> SimConfig {
        SimConfig {
            slow_stream_every: 2,
            ..SimConfig::default()
        }
    }

    #[test]
    fn signal_stays_within_fifty_microvolts() {
        for ch in 0..5 {
            for i in 0..2_560 {
                let v = eeg_signal(i as f64 / 256.0, ch);
                assert!(v.abs() < 50.0, "ch{ch} sample {i} = {v}");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn advertises_connects_and_streams() {
        let sim = SimulatedProvider::new(fast());
        let (sink, mut rx) = ProviderEventSink::channel();
        sim.attach(sink);

        sim.begin_discovery().await.unwrap();
        let device = match rx.recv().await {
            Some(ProviderEvent::PeripheralDiscovered(d)) => d,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(device.name, "Muse-SIM0");

        sim.connect(&device.address, Duration::from_secs(10)).await.unwrap();
        sim.send(StreamCommand::Start {
            enable_aux: true,
            enable_ppg: false,
        })
        .await
        .unwrap();
        assert!(sim.is_streaming());

        let mut eeg = 0;
        let mut slow = Vec::new();
        while slow.len() < 3 {
            match rx.recv().await {
                Some(ProviderEvent::PacketReceived { address, packet }) => {
                    assert_eq!(address, device.address);
                    match packet.stream.as_str() {
                        "EEG" => {
                            assert_eq!(packet.values.len(), 5);
                            eeg += 1;
                        }
                        other => slow.push(other.to_owned()),
                    }
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(eeg, 2 * EEG_SAMPLES_PER_READING);
        assert_eq!(slow, vec!["ACC", "GYRO", "BATTERY"]);

        sim.send(StreamCommand::Stop).await.unwrap();
        assert!(!sim.is_streaming());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_link_reports_disconnect() {
        let sim = SimulatedProvider::new(SimConfig::default());
        let (sink, mut rx) = ProviderEventSink::channel();
        sim.attach(sink);

        sim.connect("00:55:AA:00:00:01", Duration::from_secs(10)).await.unwrap();
        sim.drop_link();
        assert_eq!(
            rx.recv().await,
            Some(ProviderEvent::LinkStateChanged {
                address: "00:55:AA:00:00:01".into(),
                state: LinkState::Disconnected,
            })
        );
        // Streaming needs a link.
        assert!(sim
            .send(StreamCommand::Start {
                enable_aux: false,
                enable_ppg: false
            })
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_address_is_refused() {
        let sim = SimulatedProvider::new(SimConfig::default());
        let err = sim.connect("FF:FF:FF", Duration::from_secs(1)).await.unwrap_err();
        assert!(err.to_string().contains("FF:FF:FF"));
    }
}
