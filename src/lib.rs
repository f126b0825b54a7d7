//! # headband-session
//!
//! Device-session state machine and ordered event dispatch for Bluetooth
//! biosensor headbands such as the [Interaxon Muse](https://choosemuse.com/).
//!
//! A [`Session`](session::Session) drives one headset through discovery,
//! connection and streaming on a single worker task, and fans discovery,
//! state-change and sample events out to any number of listeners.  The radio
//! itself sits behind the [`RadioLinkProvider`](provider::RadioLinkProvider)
//! trait; two providers ship with the crate:
//!
//! | Provider | Module | Needs |
//! |---|---|---|
//! | [`sim::SimulatedProvider`] | [`sim`] | nothing (synthetic signal) |
//! | `ble::BtleplugProvider` | `ble` | the `ble` cargo feature and a Bluetooth adapter |
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use headband_session::prelude::*;
//! use headband_session::sim::{SimConfig, SimulatedProvider};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let provider = Arc::new(SimulatedProvider::new(SimConfig::default()));
//!     let session = Session::spawn(provider, SessionConfig::default());
//!
//!     let (listener, mut rx) = ChannelListener::new();
//!     let _sub = session.subscribe(&listener, Interest::ALL);
//!     session.start_scanning().await?;
//!
//!     while let Some(event) = rx.recv().await {
//!         match event {
//!             SessionEvent::Discovered(device) => session.connect(device).await?,
//!             SessionEvent::StateChanged(c) if c.state == ConnectionState::Connected => {
//!                 session.start_streaming().await?
//!             }
//!             SessionEvent::Sample(s) => println!("{} @ {:.0}: {:?}", s.stream, s.timestamp, s.values),
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the commonly needed types |
//! | [`session`] | The state machine, its handle and configuration |
//! | [`dispatcher`] | Listener registration, ordered fan-out, failure isolation |
//! | [`provider`] | The radio link boundary and its inbound events |
//! | [`types`] | Device records, states, stream types, samples |
//! | [`error`] | [`SessionError`](error::SessionError) |
//! | [`protocol`] | Stream layout, sampling constants, Muse command encoding, GATT UUIDs |
//! | [`parse`] | Frame validation and Muse Classic payload decoders |
//! | [`align`] | Packet-index timestamps and per-channel burst alignment |

pub mod align;
#[cfg(feature = "ble")]
pub mod ble;
pub mod dispatcher;
pub mod error;
pub mod parse;
pub mod protocol;
pub mod provider;
pub mod session;
pub mod sim;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Session ───────────────────────────────────────────────────────────────
    pub use crate::session::{Session, SessionConfig, SessionHandle, SessionSnapshot};

    // ── Listeners ─────────────────────────────────────────────────────────────
    pub use crate::dispatcher::{
        ChannelListener, DispatchStats, Interest, ListenerResult, SessionEvent, SessionListener,
        Subscription,
    };

    // ── Providers ─────────────────────────────────────────────────────────────
    pub use crate::provider::{
        LinkState, ProviderEvent, ProviderEventSink, RadioLinkProvider, StreamCommand,
    };

    // ── Data types and errors ─────────────────────────────────────────────────
    pub use crate::error::{Operation, SessionError, SessionResult};
    pub use crate::types::{
        ConnectionState, DeviceModel, DeviceRecord, RawPacket, Sample, StateChange, StreamType,
        TransitionReason,
    };

    // ── Protocol constants ────────────────────────────────────────────────────
    pub use crate::protocol::{StreamLayout, EEG_CHANNEL_NAMES, EEG_FREQUENCY, PPG_CHANNEL_NAMES};
}
