//! Bluetooth Low Energy provider for Muse headsets (Classic firmware).
//!
//! Built on `btleplug`.  Discovery and disconnect detection come from the
//! adapter's `CentralEvent` stream; sensor data comes from one GATT
//! characteristic per electrode / optical channel / IMU axis group and is
//! reassembled into multi-channel [`RawPacket`]s by [`ClassicDecoder`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::align::{now_ms, ChannelAligner, TimestampTracker};
use crate::parse::{
    decode_eeg_samples, decode_ppg_samples, parse_accelerometer, parse_gyroscope, parse_telemetry,
    split_index, ImuReading,
};
use crate::protocol::{
    decode_response, encode_command, start_sequence, ACCELEROMETER_CHARACTERISTIC,
    CONTROL_CHARACTERISTIC, EEG_CHARACTERISTICS, EEG_FREQUENCY, EEG_SAMPLES_PER_READING,
    GYROSCOPE_CHARACTERISTIC, IMU_FREQUENCY, IMU_SAMPLES_PER_READING, PPG_CHARACTERISTICS,
    PPG_FREQUENCY, PPG_SAMPLES_PER_READING, STOP_COMMAND, TELEMETRY_CHARACTERISTIC,
};
use crate::provider::{LinkState, ProviderEventSink, RadioLinkProvider, StreamCommand};
use crate::types::{DeviceRecord, RawPacket, StreamType};

// ── BleConfig ─────────────────────────────────────────────────────────────────

/// Configuration for [`BtleplugProvider`].
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Which adapter to use when the host has several.  Default: `0`.
    pub adapter_index: usize,
    /// Upper bound on GATT service discovery after the link is up.
    /// Default: 15 s.
    pub service_discovery_timeout: Duration,
    /// How long to wait for CoreBluetooth to report *poweredOn* (macOS only).
    /// Default: 3 s.
    pub power_on_timeout: Duration,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            adapter_index: 0,
            service_discovery_timeout: Duration::from_secs(15),
            power_on_timeout: Duration::from_secs(3),
        }
    }
}

// ── ClassicDecoder ────────────────────────────────────────────────────────────

/// Turns Classic-firmware notifications into provider frames.
///
/// EEG and PPG arrive as one characteristic per channel and go through a
/// [`ChannelAligner`]; IMU and telemetry notifications already carry every
/// axis and are converted directly.
pub struct ClassicDecoder {
    eeg_channels: usize,
    enable_ppg: bool,
    eeg: ChannelAligner,
    ppg: ChannelAligner,
    eeg_clock: Vec<TimestampTracker>,
    ppg_clock: Vec<TimestampTracker>,
    accel_clock: TimestampTracker,
    gyro_clock: TimestampTracker,
}

impl ClassicDecoder {
    pub fn new(enable_aux: bool, enable_ppg: bool) -> Self {
        let eeg_channels = if enable_aux { 5 } else { 4 };
        Self {
            eeg_channels,
            enable_ppg,
            eeg: ChannelAligner::new(StreamType::Eeg.label(), eeg_channels, EEG_FREQUENCY),
            ppg: ChannelAligner::new(StreamType::Ppg.label(), PPG_CHARACTERISTICS.len(), PPG_FREQUENCY),
            eeg_clock: vec![TimestampTracker::new(); eeg_channels],
            ppg_clock: vec![TimestampTracker::new(); PPG_CHARACTERISTICS.len()],
            accel_clock: TimestampTracker::new(),
            gyro_clock: TimestampTracker::new(),
        }
    }

    /// Frames carried by one notification (possibly none).
    pub fn decode(&mut self, uuid: Uuid, data: &[u8]) -> Vec<RawPacket> {
        self.decode_at(uuid, data, now_ms())
    }

    /// [`decode`](Self::decode) with an explicit clock reading.
    pub fn decode_at(&mut self, uuid: Uuid, data: &[u8], now: f64) -> Vec<RawPacket> {
        if uuid == TELEMETRY_CHARACTERISTIC {
            return parse_telemetry(data)
                .map(|t| vec![RawPacket::new(StreamType::Battery.label(), now, vec![t.battery_level])])
                .unwrap_or_default();
        }
        if uuid == ACCELEROMETER_CHARACTERISTIC {
            return parse_accelerometer(data)
                .map(|r| imu_frames(StreamType::Accelerometer, r, &mut self.accel_clock, now))
                .unwrap_or_default();
        }
        if uuid == GYROSCOPE_CHARACTERISTIC {
            return parse_gyroscope(data)
                .map(|r| imu_frames(StreamType::Gyroscope, r, &mut self.gyro_clock, now))
                .unwrap_or_default();
        }

        if let Some(electrode) = EEG_CHARACTERISTICS[..self.eeg_channels]
            .iter()
            .position(|&u| u == uuid)
        {
            let Some((index, payload)) = split_index(data) else {
                return Vec::new();
            };
            let ts = self.eeg_clock[electrode].get_at(index, EEG_SAMPLES_PER_READING, EEG_FREQUENCY, now);
            return self.eeg.push(electrode, index, ts, decode_eeg_samples(payload));
        }

        if self.enable_ppg {
            if let Some(channel) = PPG_CHARACTERISTICS.iter().position(|&u| u == uuid) {
                let Some((index, payload)) = split_index(data) else {
                    return Vec::new();
                };
                let ts = self.ppg_clock[channel].get_at(index, PPG_SAMPLES_PER_READING, PPG_FREQUENCY, now);
                return self.ppg.push(channel, index, ts, decode_ppg_samples(payload));
            }
        }

        Vec::new()
    }
}

fn imu_frames(stream: StreamType, reading: ImuReading, clock: &mut TimestampTracker, now: f64) -> Vec<RawPacket> {
    let start = clock.get_at(reading.sequence_id, IMU_SAMPLES_PER_READING, IMU_FREQUENCY, now);
    let period = 1000.0 / IMU_FREQUENCY;
    reading
        .samples
        .iter()
        .enumerate()
        .map(|(i, xyz)| RawPacket::new(stream.label(), start + i as f64 * period, xyz.to_vec()))
        .collect()
}

// ── BtleplugProvider ──────────────────────────────────────────────────────────

struct Link {
    address: String,
    peripheral: Peripheral,
    control: Characteristic,
    notifications: AbortHandle,
}

#[derive(Default)]
struct BleState {
    sink: Option<ProviderEventSink>,
    /// Every named peripheral seen so far, by address.
    peripherals: HashMap<String, Peripheral>,
    link: Option<Link>,
    adapter_events: Option<AbortHandle>,
}

/// A [`RadioLinkProvider`] talking to real Muse hardware through `btleplug`.
pub struct BtleplugProvider {
    config: BleConfig,
    adapter: OnceCell<Adapter>,
    state: Arc<Mutex<BleState>>,
    decoder: Arc<Mutex<ClassicDecoder>>,
}

impl BtleplugProvider {
    pub fn new(config: BleConfig) -> Self {
        Self {
            config,
            adapter: OnceCell::new(),
            state: Arc::new(Mutex::new(BleState::default())),
            decoder: Arc::new(Mutex::new(ClassicDecoder::new(false, false))),
        }
    }

    async fn adapter(&self) -> Result<Adapter> {
        let adapter = self
            .adapter
            .get_or_try_init(|| async {
                let manager = Manager::new().await?;
                let adapter = manager
                    .adapters()
                    .await?
                    .into_iter()
                    .nth(self.config.adapter_index)
                    .ok_or_else(|| anyhow!("Bluetooth adapter #{} not found", self.config.adapter_index))?;
                wait_powered_on(&adapter, self.config.power_on_timeout).await;
                Ok::<_, anyhow::Error>(adapter)
            })
            .await?;
        Ok(adapter.clone())
    }

    /// Start forwarding adapter events once; later calls are no-ops.
    async fn watch_adapter(&self, adapter: &Adapter) -> Result<()> {
        if self.state.lock().adapter_events.is_some() {
            return Ok(());
        }
        let mut events = adapter.events().await?;
        let adapter = adapter.clone();
        let state = Arc::clone(&self.state);

        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        let Ok(peripheral) = adapter.peripheral(&id).await else {
                            continue;
                        };
                        let Ok(Some(props)) = peripheral.properties().await else {
                            continue;
                        };
                        let Some(name) = props.local_name else {
                            continue;
                        };
                        let address = id.to_string();
                        let sink = {
                            let mut state = state.lock();
                            state.peripherals.insert(address.clone(), peripheral);
                            state.sink.clone()
                        };
                        if let Some(sink) = sink {
                            sink.discovered(DeviceRecord::new(name, address));
                        }
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let address = id.to_string();
                        let (sink, ours) = {
                            let mut state = state.lock();
                            let ours = state.link.as_ref().is_some_and(|l| l.address == address);
                            if ours {
                                if let Some(link) = state.link.take() {
                                    link.notifications.abort();
                                }
                            }
                            (state.sink.clone(), ours)
                        };
                        if ours {
                            info!("{address} disconnected");
                        }
                        if let Some(sink) = sink {
                            sink.link_state(address, LinkState::Disconnected);
                        }
                    }
                    _ => {}
                }
            }
            debug!("adapter event stream ended");
        });
        self.state.lock().adapter_events = Some(task.abort_handle());
        Ok(())
    }

    fn linked(&self) -> Result<(Peripheral, Characteristic)> {
        self.state
            .lock()
            .link
            .as_ref()
            .map(|l| (l.peripheral.clone(), l.control.clone()))
            .ok_or_else(|| anyhow!("no headset connected"))
    }

    async fn write_command(peripheral: &Peripheral, control: &Characteristic, cmd: &str) -> Result<()> {
        debug!("→ {cmd}");
        peripheral
            .write(control, &encode_command(cmd), WriteType::WithoutResponse)
            .await?;
        Ok(())
    }
}

/// CoreBluetooth starts in an "unknown" state, and scanning before it reports
/// *poweredOn* silently finds nothing.
#[cfg(target_os = "macos")]
async fn wait_powered_on(adapter: &Adapter, limit: Duration) {
    use btleplug::api::CentralState;

    let deadline = tokio::time::Instant::now() + limit;
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => break,
            Ok(state) if tokio::time::Instant::now() >= deadline => {
                warn!("adapter still {state:?} after {limit:?}; continuing");
                break;
            }
            Ok(state) => debug!("adapter state {state:?}, waiting"),
            Err(e) => {
                warn!("adapter_state(): {e}");
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[cfg(not(target_os = "macos"))]
async fn wait_powered_on(_adapter: &Adapter, _limit: Duration) {}

#[async_trait]
impl RadioLinkProvider for BtleplugProvider {
    fn attach(&self, events: ProviderEventSink) {
        self.state.lock().sink = Some(events);
    }

    async fn begin_discovery(&self) -> Result<()> {
        let adapter = self.adapter().await?;
        self.watch_adapter(&adapter).await?;
        adapter.start_scan(ScanFilter::default()).await?;
        info!("scanning");
        Ok(())
    }

    async fn end_discovery(&self) -> Result<()> {
        let adapter = self.adapter().await?;
        adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, address: &str, timeout: Duration) -> Result<()> {
        let peripheral = self
            .state
            .lock()
            .peripherals
            .get(address)
            .cloned()
            .ok_or_else(|| anyhow!("{address} has not been discovered"))?;

        // BlueZ's Device1.Connect can block forever on a stale device.
        tokio::time::timeout(timeout, peripheral.connect())
            .await
            .map_err(|_| anyhow!("BLE connect() timed out after {timeout:?}"))??;

        // BlueZ reports the link before its GATT cache is populated.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        let limit = self.config.service_discovery_timeout;
        tokio::time::timeout(limit, peripheral.discover_services())
            .await
            .map_err(|_| anyhow!("discover_services() timed out after {limit:?}"))??;

        let chars: BTreeSet<Characteristic> = peripheral.characteristics();
        let find = |uuid: Uuid| chars.iter().find(|c| c.uuid == uuid).cloned();

        let control = find(CONTROL_CHARACTERISTIC)
            .ok_or_else(|| anyhow!("control characteristic {CONTROL_CHARACTERISTIC} not found"))?;
        peripheral.subscribe(&control).await?;

        for uuid in [TELEMETRY_CHARACTERISTIC, ACCELEROMETER_CHARACTERISTIC, GYROSCOPE_CHARACTERISTIC]
            .into_iter()
            .chain(EEG_CHARACTERISTICS)
        {
            match find(uuid) {
                Some(c) => peripheral.subscribe(&c).await?,
                None => warn!("{address}: characteristic {uuid} not found"),
            }
        }
        // Optical sensors exist on Muse 2 / Muse S only.
        for uuid in PPG_CHARACTERISTICS {
            match find(uuid) {
                Some(c) => peripheral.subscribe(&c).await?,
                None => debug!("{address}: no PPG characteristic {uuid}"),
            }
        }

        let mut notifications = peripheral.notifications().await?;
        let sink = self
            .state
            .lock()
            .sink
            .clone()
            .ok_or_else(|| anyhow!("provider is not attached to a session"))?;
        let decoder = Arc::clone(&self.decoder);
        let source = address.to_owned();
        let task = tokio::spawn(async move {
            let mut count: u64 = 0;
            while let Some(n) = notifications.next().await {
                count += 1;
                if count <= 5 || count % 500 == 0 {
                    debug!("notification #{count} uuid={} len={}", n.uuid, n.value.len());
                }
                if n.uuid == CONTROL_CHARACTERISTIC {
                    debug!("control: {:?}", decode_response(&n.value));
                    continue;
                }
                let frames = decoder.lock().decode(n.uuid, &n.value);
                for frame in frames {
                    if !sink.packet(source.as_str(), frame) {
                        return;
                    }
                }
            }
            debug!("notification stream from {source} ended");
        });

        let previous = self.state.lock().link.replace(Link {
            address: address.to_owned(),
            peripheral,
            control,
            notifications: task.abort_handle(),
        });
        if let Some(previous) = previous {
            previous.notifications.abort();
        }
        info!("connected to {address}");
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        let link = {
            let mut state = self.state.lock();
            match state.link.as_ref() {
                Some(l) if l.address == address => state.link.take(),
                _ => None,
            }
        };
        let peripheral = match link {
            Some(link) => {
                link.notifications.abort();
                link.peripheral
            }
            // A connect still in flight has no link yet.
            None => {
                let known = self.state.lock().peripherals.get(address).cloned();
                match known {
                    Some(p) => p,
                    None => return Ok(()),
                }
            }
        };
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn send(&self, command: StreamCommand) -> Result<()> {
        let (peripheral, control) = self.linked()?;
        match command {
            StreamCommand::Start {
                enable_aux,
                enable_ppg,
            } => {
                *self.decoder.lock() = ClassicDecoder::new(enable_aux, enable_ppg);
                for cmd in start_sequence(enable_aux, enable_ppg) {
                    Self::write_command(&peripheral, &control, cmd).await?;
                }
            }
            StreamCommand::Stop => Self::write_command(&peripheral, &control, STOP_COMMAND).await?,
        }
        Ok(())
    }
}
