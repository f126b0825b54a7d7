//! The radio link provider boundary.
//!
//! A provider owns the physical transport.  The session drives it through
//! [`RadioLinkProvider`] and receives its asynchronous callbacks through the
//! [`ProviderEventSink`] handed over in [`RadioLinkProvider::attach`].  The
//! sink may be called from any thread; events are queued for the session
//! worker and never touch session state directly.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{DeviceRecord, RawPacket};

/// Link-level state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// Stream-control commands sent to a connected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCommand {
    Start { enable_aux: bool, enable_ppg: bool },
    Stop,
}

/// Inbound callbacks from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    PeripheralDiscovered(DeviceRecord),
    LinkStateChanged { address: String, state: LinkState },
    PacketReceived { address: String, packet: RawPacket },
}

/// Where a provider delivers its [`ProviderEvent`]s.
///
/// Cloneable and non-blocking; sending after the session has shut down is a
/// silent no-op (reported through the return value of [`emit`](Self::emit)).
#[derive(Clone)]
pub struct ProviderEventSink {
    forward: Arc<dyn Fn(ProviderEvent) -> bool + Send + Sync>,
}

impl fmt::Debug for ProviderEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderEventSink").finish_non_exhaustive()
    }
}

impl ProviderEventSink {
    /// Sink that maps every event into `tx`, so provider events share a
    /// queue (and therefore an ordering) with other messages.
    ///
    /// Holds the sender weakly: a provider keeping its sink alive does not
    /// keep the receiving worker alive.
    pub(crate) fn forwarding<M, F>(tx: mpsc::WeakUnboundedSender<M>, wrap: F) -> Self
    where
        M: Send + 'static,
        F: Fn(ProviderEvent) -> M + Send + Sync + 'static,
    {
        Self {
            forward: Arc::new(move |event| match tx.upgrade() {
                Some(tx) => tx.send(wrap(event)).is_ok(),
                None => false,
            }),
        }
    }

    /// A sink wired to a plain receiver; for driving providers without a session.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProviderEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            forward: Arc::new(move |event| tx.send(event).is_ok()),
        };
        (sink, rx)
    }

    /// Queue an event; `false` once nobody is listening anymore.
    pub fn emit(&self, event: ProviderEvent) -> bool {
        (self.forward)(event)
    }

    pub fn discovered(&self, device: DeviceRecord) -> bool {
        self.emit(ProviderEvent::PeripheralDiscovered(device))
    }

    pub fn link_state(&self, address: impl Into<String>, state: LinkState) -> bool {
        self.emit(ProviderEvent::LinkStateChanged {
            address: address.into(),
            state,
        })
    }

    pub fn packet(&self, address: impl Into<String>, packet: RawPacket) -> bool {
        self.emit(ProviderEvent::PacketReceived {
            address: address.into(),
            packet,
        })
    }
}

/// The transport capability the session depends on.
///
/// `connect` and `disconnect` may take a while; the session bounds both with
/// its own timeouts and never waits on them from its worker loop.  Discovery
/// and stream-control calls are expected to return promptly.
#[async_trait]
pub trait RadioLinkProvider: Send + Sync {
    /// Called once by the session before any other method.
    fn attach(&self, events: ProviderEventSink);

    async fn begin_discovery(&self) -> Result<()>;

    async fn end_discovery(&self) -> Result<()>;

    /// Establish a link.  `Ok` means the link is usable.
    async fn connect(&self, address: &str, timeout: Duration) -> Result<()>;

    /// Tear down a link.  `Ok` confirms teardown.
    async fn disconnect(&self, address: &str) -> Result<()>;

    async fn send(&self, command: StreamCommand) -> Result<()>;
}
