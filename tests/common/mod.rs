#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use headband_session::prelude::*;

/// How the scripted provider answers `connect`.
#[derive(Debug, Clone)]
pub enum OnConnect {
    Succeed,
    Fail(String),
    /// Never returns; the test confirms (or not) through link-state events.
    Hang,
}

/// How the scripted provider answers `disconnect`.
#[derive(Debug, Clone)]
pub enum OnDisconnect {
    Succeed,
    Hang,
}

/// How the scripted provider answers `send`.
#[derive(Debug, Clone)]
pub enum OnSend {
    Succeed,
    Hang,
}

/// A provider driven entirely by the test.
pub struct ScriptedProvider {
    sink: Mutex<Option<ProviderEventSink>>,
    on_connect: Mutex<OnConnect>,
    on_disconnect: Mutex<OnDisconnect>,
    on_send: Mutex<OnSend>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(on_connect: OnConnect, on_disconnect: OnDisconnect) -> Arc<Self> {
        Arc::new(Self {
            sink: Mutex::new(None),
            on_connect: Mutex::new(on_connect),
            on_disconnect: Mutex::new(on_disconnect),
            on_send: Mutex::new(OnSend::Succeed),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::new(OnConnect::Succeed, OnDisconnect::Succeed)
    }

    pub fn set_on_connect(&self, behaviour: OnConnect) {
        *self.on_connect.lock() = behaviour;
    }

    pub fn set_on_disconnect(&self, behaviour: OnDisconnect) {
        *self.on_disconnect.lock() = behaviour;
    }

    pub fn set_on_send(&self, behaviour: OnSend) {
        *self.on_send.lock() = behaviour;
    }

    pub fn sink(&self) -> ProviderEventSink {
        self.sink.lock().clone().expect("provider not attached")
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn discovered(&self, name: &str, address: &str) {
        self.sink().discovered(DeviceRecord::new(name, address));
    }

    pub fn link(&self, address: &str, state: LinkState) {
        self.sink().link_state(address, state);
    }

    pub fn packet(&self, address: &str, stream: &str, timestamp: f64, values: Vec<f64>) {
        self.sink().packet(address, RawPacket::new(stream, timestamp, values));
    }

    pub fn eeg(&self, address: &str, timestamp: f64) {
        self.packet(address, "EEG", timestamp, vec![timestamp, 2.0, 3.0, 4.0]);
    }
}

#[async_trait]
impl RadioLinkProvider for ScriptedProvider {
    fn attach(&self, events: ProviderEventSink) {
        *self.sink.lock() = Some(events);
    }

    async fn begin_discovery(&self) -> anyhow::Result<()> {
        self.calls.lock().push("begin_discovery".into());
        Ok(())
    }

    async fn end_discovery(&self) -> anyhow::Result<()> {
        self.calls.lock().push("end_discovery".into());
        Ok(())
    }

    async fn connect(&self, address: &str, _timeout: Duration) -> anyhow::Result<()> {
        self.calls.lock().push(format!("connect {address}"));
        let behaviour = self.on_connect.lock().clone();
        match behaviour {
            OnConnect::Succeed => Ok(()),
            OnConnect::Fail(reason) => Err(anyhow!(reason)),
            OnConnect::Hang => std::future::pending().await,
        }
    }

    async fn disconnect(&self, address: &str) -> anyhow::Result<()> {
        self.calls.lock().push(format!("disconnect {address}"));
        let behaviour = self.on_disconnect.lock().clone();
        match behaviour {
            OnDisconnect::Succeed => Ok(()),
            OnDisconnect::Hang => std::future::pending().await,
        }
    }

    async fn send(&self, command: StreamCommand) -> anyhow::Result<()> {
        self.calls.lock().push(format!("send {command:?}"));
        let behaviour = self.on_send.lock().clone();
        match behaviour {
            OnSend::Succeed => Ok(()),
            OnSend::Hang => std::future::pending().await,
        }
    }
}

/// Session defaults with the scan timer off, so paused-clock tests do not
/// auto-advance into a scan timeout.
pub fn config() -> SessionConfig {
    SessionConfig {
        scan_timeout: None,
        ..SessionConfig::default()
    }
}

pub const ADDRESS: &str = "AA:BB:CC";

pub fn muse_a() -> DeviceRecord {
    DeviceRecord::new("MuseA", ADDRESS)
}

/// Drive a session to `Streaming` with the scripted provider.
pub async fn streaming(provider: &Arc<ScriptedProvider>, config: SessionConfig) -> SessionHandle {
    let session = Session::spawn(provider.clone(), config);
    session.connect(muse_a()).await.unwrap();
    session.wait_for_state(ConnectionState::Connected).await.unwrap();
    session.start_streaming().await.unwrap();
    session
}

/// Next state change on a connection-interest channel.
pub async fn next_change(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> StateChange {
    loop {
        match rx.recv().await {
            Some(SessionEvent::StateChanged(change)) => return change,
            Some(_) => continue,
            None => panic!("event channel closed"),
        }
    }
}

/// Let the worker and every delivery task catch up.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Everything already queued on `rx`, after letting delivery tasks run.
pub async fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    settle().await;
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

pub fn states(events: &[SessionEvent]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StateChanged(c) => Some(c.state),
            _ => None,
        })
        .collect()
}

pub fn samples(events: &[SessionEvent]) -> Vec<Sample> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Sample(s) => Some(s.clone()),
            _ => None,
        })
        .collect()
}
