//! Fan-out of discovery, state-change and sample events to listeners.
//!
//! Each subscription owns an ordered queue drained by its own task.  The
//! session worker enqueues every event to every interested subscriber in one
//! pass, so all listeners observe the same relative order, and a slow or
//! failing listener only ever delays itself.
//!
//! Listeners are held by [`Weak`] reference: dropping the last `Arc` of a
//! listener ends its subscription without any explicit call.

use std::any::Any;
use std::ops::BitOr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::anyhow;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::SessionError;
use crate::parse::decode_sample;
use crate::protocol::StreamLayout;
use crate::types::{DeviceRecord, RawPacket, Sample, StateChange};

/// What a listener callback returns; `Err` is logged and counted, nothing more.
pub type ListenerResult = anyhow::Result<()>;

// ── Listener interface ────────────────────────────────────────────────────────

/// Receives session events.  Every callback is optional.
///
/// Callbacks run on the subscription's delivery task, never on the session
/// worker, and must not block for long: events for this listener queue up
/// behind a slow callback.
pub trait SessionListener: Send + Sync {
    fn on_device_discovered(&self, _device: &DeviceRecord) -> ListenerResult {
        Ok(())
    }

    fn on_connection_state_changed(&self, _change: &StateChange) -> ListenerResult {
        Ok(())
    }

    /// A command was refused; the state did not change.
    fn on_command_rejected(&self, _error: &SessionError) -> ListenerResult {
        Ok(())
    }

    fn on_sample_received(&self, _sample: &Sample) -> ListenerResult {
        Ok(())
    }
}

/// Which callback groups a subscription receives.
///
/// `connection` covers both state changes and command rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub discovery: bool,
    pub connection: bool,
    pub data: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        discovery: false,
        connection: false,
        data: false,
    };
    pub const DISCOVERY: Interest = Interest {
        discovery: true,
        ..Interest::NONE
    };
    pub const CONNECTION: Interest = Interest {
        connection: true,
        ..Interest::NONE
    };
    pub const DATA: Interest = Interest {
        data: true,
        ..Interest::NONE
    };
    pub const ALL: Interest = Interest {
        discovery: true,
        connection: true,
        data: true,
    };
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest {
            discovery: self.discovery || rhs.discovery,
            connection: self.connection || rhs.connection,
            data: self.data || rhs.data,
        }
    }
}

// ── Channel adapter ───────────────────────────────────────────────────────────

/// Every listener callback as one enum, for channel-based consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Discovered(DeviceRecord),
    StateChanged(StateChange),
    CommandRejected(SessionError),
    Sample(Sample),
}

/// A listener that forwards every callback into an mpsc channel.
///
/// ```no_run
/// # use headband_session::prelude::*;
/// # async fn demo(session: SessionHandle) {
/// let (listener, mut rx) = ChannelListener::new();
/// let _sub = session.subscribe(&listener, Interest::ALL);
/// while let Some(event) = rx.recv().await {
///     if let SessionEvent::Sample(s) = event {
///         println!("{} {:?}", s.stream, s.values);
///     }
/// }
/// # }
/// ```
#[derive(Debug)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, event: SessionEvent) -> ListenerResult {
        self.tx
            .send(event)
            .map_err(|_| anyhow!("event receiver was dropped"))
    }
}

impl SessionListener for ChannelListener {
    fn on_device_discovered(&self, device: &DeviceRecord) -> ListenerResult {
        self.forward(SessionEvent::Discovered(device.clone()))
    }

    fn on_connection_state_changed(&self, change: &StateChange) -> ListenerResult {
        self.forward(SessionEvent::StateChanged(change.clone()))
    }

    fn on_command_rejected(&self, error: &SessionError) -> ListenerResult {
        self.forward(SessionEvent::CommandRejected(error.clone()))
    }

    fn on_sample_received(&self, sample: &Sample) -> ListenerResult {
        self.forward(SessionEvent::Sample(sample.clone()))
    }
}

// ── Counters ──────────────────────────────────────────────────────────────────

/// Aggregate dispatch counters.  Monotonic for the life of the session.
#[derive(Debug, Default)]
pub struct DispatchStats {
    samples_delivered: AtomicU64,
    malformed_packets: AtomicU64,
    dropped_packets: AtomicU64,
    listener_failures: AtomicU64,
}

impl DispatchStats {
    /// Sample callbacks that completed successfully (one per listener).
    pub fn samples_delivered(&self) -> u64 {
        self.samples_delivered.load(Ordering::Relaxed)
    }

    /// Frames that failed validation.
    pub fn malformed_packets(&self) -> u64 {
        self.malformed_packets.load(Ordering::Relaxed)
    }

    /// Frames or queued samples discarded because the session was not streaming.
    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets.load(Ordering::Relaxed)
    }

    /// Callbacks that returned `Err` or panicked.
    pub fn listener_failures(&self) -> u64 {
        self.listener_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped_packets.fetch_add(1, Ordering::Relaxed);
    }
}

// ── Stream gate ───────────────────────────────────────────────────────────────

/// Epoch counter: odd while streaming, bumped on every open and close.
///
/// Samples are stamped with the epoch they were decoded in and delivered only
/// while that epoch is still current.  The check is made immediately before
/// each callback; a callback already running when the epoch closes is not
/// interrupted.
#[derive(Debug, Default)]
struct StreamGate {
    epoch: AtomicU64,
}

impl StreamGate {
    fn current(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.current() % 2 == 1
    }

    fn is_live(&self, epoch: u64) -> bool {
        epoch % 2 == 1 && self.current() == epoch
    }

    fn open(&self) {
        if !self.is_open() {
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn close(&self) {
        if self.is_open() {
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Delivery {
    Discovered(Arc<DeviceRecord>),
    StateChanged(Arc<StateChange>),
    Rejected(Arc<SessionError>),
    Sample { epoch: u64, sample: Arc<Sample> },
}

impl Delivery {
    fn wanted_by(&self, interest: Interest) -> bool {
        match self {
            Delivery::Discovered(_) => interest.discovery,
            Delivery::StateChanged(_) | Delivery::Rejected(_) => interest.connection,
            Delivery::Sample { .. } => interest.data,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Delivery::Discovered(_) => "discovery",
            Delivery::StateChanged(_) => "state change",
            Delivery::Rejected(_) => "command rejection",
            Delivery::Sample { .. } => "sample",
        }
    }

    fn deliver(&self, listener: &dyn SessionListener) -> ListenerResult {
        match self {
            Delivery::Discovered(device) => listener.on_device_discovered(device),
            Delivery::StateChanged(change) => listener.on_connection_state_changed(change),
            Delivery::Rejected(error) => listener.on_command_rejected(error),
            Delivery::Sample { sample, .. } => listener.on_sample_received(sample),
        }
    }
}

struct Registration {
    id: u64,
    interest: Interest,
    target: Weak<dyn SessionListener>,
    queue: mpsc::UnboundedSender<Delivery>,
}

impl Registration {
    fn is_alive(&self) -> bool {
        self.target.strong_count() > 0 && !self.queue.is_closed()
    }
}

/// Drop registrations whose listener is gone; their delivery tasks end once
/// the queue sender is dropped.
fn prune(registrations: &mut Vec<Registration>) {
    registrations.retain(Registration::is_alive);
}

struct Shared {
    registrations: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
    stats: Arc<DispatchStats>,
    gate: StreamGate,
    layout: StreamLayout,
}

impl Shared {
    fn remove(&self, id: u64) {
        self.registrations.lock().retain(|r| r.id != id);
    }
}

/// Decodes provider frames and fans events out to subscribers.
///
/// Cheap to clone; all clones share registrations and counters.
#[derive(Clone)]
pub struct EventDispatcher {
    shared: Arc<Shared>,
}

impl EventDispatcher {
    pub fn new(layout: StreamLayout) -> Self {
        Self {
            shared: Arc::new(Shared {
                registrations: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                stats: Arc::new(DispatchStats::default()),
                gate: StreamGate::default(),
                layout,
            }),
        }
    }

    /// Register `listener` for the callback groups in `interest`.
    ///
    /// Only a weak reference is kept.  Must be called from within a tokio
    /// runtime (the delivery task is spawned here).
    pub fn subscribe<L>(&self, listener: &Arc<L>, interest: Interest) -> Subscription
    where
        L: SessionListener + 'static,
    {
        let strong: Arc<dyn SessionListener> = listener.clone();
        let target = Arc::downgrade(&strong);
        drop(strong);

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let (queue, rx) = mpsc::unbounded_channel();
        {
            let mut registrations = self.shared.registrations.lock();
            prune(&mut registrations);
            registrations.push(Registration {
                id,
                interest,
                target: target.clone(),
                queue,
            });
        }
        tokio::spawn(deliver_loop(
            id,
            Arc::downgrade(&self.shared),
            target,
            rx,
            Arc::clone(&active),
        ));
        debug!("listener {id} subscribed ({interest:?})");

        Subscription {
            id,
            active,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Registrations whose listener is still alive.
    pub fn listener_count(&self) -> usize {
        let mut registrations = self.shared.registrations.lock();
        prune(&mut registrations);
        registrations.len()
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.shared.stats)
    }

    pub fn on_discovered(&self, device: &DeviceRecord) {
        self.broadcast(Delivery::Discovered(Arc::new(device.clone())));
    }

    pub fn on_connection_changed(&self, change: &StateChange) {
        self.broadcast(Delivery::StateChanged(Arc::new(change.clone())));
    }

    pub fn on_command_rejected(&self, error: &SessionError) {
        self.broadcast(Delivery::Rejected(Arc::new(error.clone())));
    }

    /// Decode and deliver one frame.  Frames arriving while the stream gate is
    /// closed are dropped, malformed frames are counted; neither reaches a
    /// listener.
    pub fn on_data_received(&self, packet: &RawPacket) {
        let shared = &self.shared;
        if !shared.gate.is_open() {
            shared.stats.record_dropped();
            return;
        }
        match decode_sample(packet, &shared.layout) {
            Ok(sample) => self.broadcast(Delivery::Sample {
                epoch: shared.gate.current(),
                sample: Arc::new(sample),
            }),
            Err(err) => {
                shared.stats.malformed_packets.fetch_add(1, Ordering::Relaxed);
                debug!("{err}");
            }
        }
    }

    /// Start a new stream epoch.
    pub(crate) fn open_stream(&self) {
        self.shared.gate.open();
    }

    /// End the current stream epoch; queued samples from it are discarded.
    pub(crate) fn close_stream(&self) {
        self.shared.gate.close();
    }

    fn broadcast(&self, delivery: Delivery) {
        let mut registrations = self.shared.registrations.lock();
        // A failed send means the delivery task is gone: listener dropped.
        registrations.retain(|r| {
            r.is_alive() && (!delivery.wanted_by(r.interest) || r.queue.send(delivery.clone()).is_ok())
        });
    }
}

async fn deliver_loop(
    id: u64,
    shared: Weak<Shared>,
    target: Weak<dyn SessionListener>,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    active: Arc<AtomicBool>,
) {
    while let Some(delivery) = rx.recv().await {
        if !active.load(Ordering::SeqCst) {
            break;
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let Some(listener) = target.upgrade() else {
            debug!("listener {id} was dropped; unsubscribing");
            shared.remove(id);
            break;
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            if let Delivery::Sample { epoch, .. } = &delivery {
                if !shared.gate.is_live(*epoch) {
                    return None;
                }
            }
            Some(delivery.deliver(listener.as_ref()))
        }));
        drop(listener);

        let failure = match outcome {
            Ok(None) => {
                shared.stats.record_dropped();
                continue;
            }
            Ok(Some(Ok(()))) => {
                if matches!(delivery, Delivery::Sample { .. }) {
                    shared.stats.samples_delivered.fetch_add(1, Ordering::Relaxed);
                }
                continue;
            }
            Ok(Some(Err(err))) => format!("listener {id} failed on {}: {err:#}", delivery.kind()),
            Err(payload) => format!(
                "listener {id} panicked on {}: {}",
                delivery.kind(),
                panic_message(payload.as_ref())
            ),
        };
        shared.stats.listener_failures.fetch_add(1, Ordering::Relaxed);
        warn!("{}", SessionError::ListenerFailure(failure));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

// ── Subscription ──────────────────────────────────────────────────────────────

/// Handle to one registration.
///
/// Dropping it does *not* unsubscribe; the listener stays registered until
/// [`unsubscribe`](Self::unsubscribe) is called or the listener is dropped.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop deliveries.  Idempotent, and safe to call from inside one of the
    /// listener's own callbacks; no callback starts after this returns.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            if let Some(shared) = self.shared.upgrade() {
                shared.remove(self.id);
            }
            debug!("listener {} unsubscribed", self.id);
        }
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("registrations", &self.registrations.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConnectionState, StreamType};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        samples: Mutex<Vec<Sample>>,
        states: Mutex<Vec<ConnectionState>>,
        discovered: Mutex<Vec<String>>,
    }

    impl SessionListener for Recorder {
        fn on_device_discovered(&self, device: &DeviceRecord) -> ListenerResult {
            self.discovered.lock().push(device.address.clone());
            Ok(())
        }

        fn on_connection_state_changed(&self, change: &StateChange) -> ListenerResult {
            self.states.lock().push(change.state);
            Ok(())
        }

        fn on_sample_received(&self, sample: &Sample) -> ListenerResult {
            self.samples.lock().push(sample.clone());
            Ok(())
        }
    }

    struct Failing;

    impl SessionListener for Failing {
        fn on_sample_received(&self, _sample: &Sample) -> ListenerResult {
            Err(anyhow!("disk full"))
        }
    }

    struct Panicking;

    impl SessionListener for Panicking {
        fn on_sample_received(&self, _sample: &Sample) -> ListenerResult {
            panic!("listener bug");
        }
    }

    fn eeg(t: f64) -> RawPacket {
        RawPacket::new("EEG", t, vec![t, t + 1.0, t + 2.0, t + 3.0])
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn timestamps(r: &Recorder) -> Vec<f64> {
        r.samples.lock().iter().map(|s| s.timestamp).collect()
    }

    #[tokio::test]
    async fn listeners_see_identical_order() {
        let dispatcher = EventDispatcher::new(StreamLayout::default());
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let _sa = dispatcher.subscribe(&a, Interest::DATA);
        let _sb = dispatcher.subscribe(&b, Interest::ALL);

        dispatcher.open_stream();
        for t in 0..50 {
            dispatcher.on_data_received(&eeg(t as f64));
        }
        settle().await;

        let expected: Vec<f64> = (0..50).map(|t| t as f64).collect();
        assert_eq!(timestamps(&a), expected);
        assert_eq!(timestamps(&b), expected);
        assert_eq!(a.samples.lock()[0].stream, StreamType::Eeg);
        assert_eq!(dispatcher.stats().samples_delivered(), 100);
    }

    #[tokio::test]
    async fn interest_filters_callback_groups() {
        let dispatcher = EventDispatcher::new(StreamLayout::default());
        let data_only = Arc::new(Recorder::default());
        let conn_only = Arc::new(Recorder::default());
        let _s1 = dispatcher.subscribe(&data_only, Interest::DATA);
        let _s2 = dispatcher.subscribe(&conn_only, Interest::CONNECTION | Interest::DISCOVERY);

        dispatcher.open_stream();
        dispatcher.on_discovered(&DeviceRecord::new("MuseA", "AA:BB:CC"));
        dispatcher.on_connection_changed(&StateChange {
            previous: ConnectionState::Connected,
            state: ConnectionState::Streaming,
            device: None,
            reason: None,
        });
        dispatcher.on_data_received(&eeg(1.0));
        settle().await;

        assert_eq!(data_only.samples.lock().len(), 1);
        assert!(data_only.states.lock().is_empty());
        assert!(data_only.discovered.lock().is_empty());
        assert!(conn_only.samples.lock().is_empty());
        assert_eq!(*conn_only.states.lock(), vec![ConnectionState::Streaming]);
        assert_eq!(*conn_only.discovered.lock(), vec!["AA:BB:CC".to_string()]);
    }

    #[tokio::test]
    async fn malformed_frames_are_counted_not_delivered() {
        let dispatcher = EventDispatcher::new(StreamLayout::default());
        let r = Arc::new(Recorder::default());
        let _s = dispatcher.subscribe(&r, Interest::DATA);

        dispatcher.open_stream();
        dispatcher.on_data_received(&RawPacket::new("EEG", 1.0, vec![1.0, 2.0]));
        dispatcher.on_data_received(&RawPacket::new("XYZ", 2.0, vec![0.0; 4]));
        dispatcher.on_data_received(&eeg(3.0));
        settle().await;

        assert_eq!(timestamps(&r), vec![3.0]);
        assert_eq!(dispatcher.stats().malformed_packets(), 2);
    }

    #[tokio::test]
    async fn closed_gate_drops_frames_and_queued_samples() {
        let dispatcher = EventDispatcher::new(StreamLayout::default());
        let r = Arc::new(Recorder::default());
        let _s = dispatcher.subscribe(&r, Interest::DATA);

        // Not streaming yet.
        dispatcher.on_data_received(&eeg(0.0));

        // Queued during the epoch, but the epoch ends before the delivery
        // task gets to run (single-threaded test runtime).
        dispatcher.open_stream();
        dispatcher.on_data_received(&eeg(1.0));
        dispatcher.on_data_received(&eeg(2.0));
        dispatcher.close_stream();
        settle().await;
        assert!(r.samples.lock().is_empty());
        assert_eq!(dispatcher.stats().dropped_packets(), 3);

        // A new epoch delivers again.
        dispatcher.open_stream();
        dispatcher.on_data_received(&eeg(3.0));
        settle().await;
        assert_eq!(timestamps(&r), vec![3.0]);
    }

    #[tokio::test]
    async fn failures_are_isolated_per_listener() {
        let dispatcher = EventDispatcher::new(StreamLayout::default());
        let failing = Arc::new(Failing);
        let panicking = Arc::new(Panicking);
        let healthy = Arc::new(Recorder::default());
        let _s1 = dispatcher.subscribe(&failing, Interest::DATA);
        let _s2 = dispatcher.subscribe(&panicking, Interest::DATA);
        let _s3 = dispatcher.subscribe(&healthy, Interest::DATA);

        dispatcher.open_stream();
        dispatcher.on_data_received(&eeg(1.0));
        dispatcher.on_data_received(&eeg(2.0));
        settle().await;

        assert_eq!(timestamps(&healthy), vec![1.0, 2.0]);
        assert_eq!(dispatcher.stats().listener_failures(), 4);
        // Failing listeners stay subscribed.
        assert_eq!(dispatcher.listener_count(), 3);
    }

    #[tokio::test]
    async fn dropped_listener_is_pruned() {
        let dispatcher = EventDispatcher::new(StreamLayout::default());
        let r = Arc::new(Recorder::default());
        let sub = dispatcher.subscribe(&r, Interest::ALL);
        assert_eq!(dispatcher.listener_count(), 1);

        drop(r);
        dispatcher.on_discovered(&DeviceRecord::new("MuseA", "AA:BB:CC"));
        settle().await;
        dispatcher.on_discovered(&DeviceRecord::new("MuseB", "DD:EE:FF"));

        assert_eq!(dispatcher.listener_count(), 0);
        // Unsubscribing afterwards is harmless.
        sub.unsubscribe();
    }

    #[tokio::test]
    async fn dropped_listener_is_pruned_without_matching_events() {
        let dispatcher = EventDispatcher::new(StreamLayout::default());
        let scanner = Arc::new(Recorder::default());
        let watcher = Arc::new(Recorder::default());
        let _s1 = dispatcher.subscribe(&scanner, Interest::DISCOVERY);
        let _s2 = dispatcher.subscribe(&watcher, Interest::CONNECTION);

        drop(scanner);
        assert_eq!(dispatcher.listener_count(), 1);

        // Unrelated traffic also prunes, and the survivor still hears it.
        let other = Arc::new(Recorder::default());
        let _s3 = dispatcher.subscribe(&other, Interest::DATA);
        drop(other);
        dispatcher.on_connection_changed(&StateChange {
            previous: ConnectionState::Idle,
            state: ConnectionState::Scanning,
            device: None,
            reason: None,
        });
        settle().await;
        assert_eq!(dispatcher.shared.registrations.lock().len(), 1);
        assert_eq!(*watcher.states.lock(), vec![ConnectionState::Scanning]);
    }

    /// Closes the stream from inside its first sample callback.
    struct Closer {
        dispatcher: EventDispatcher,
        seen: AtomicU64,
    }

    impl SessionListener for Closer {
        fn on_sample_received(&self, _sample: &Sample) -> ListenerResult {
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.dispatcher.close_stream();
            Ok(())
        }
    }

    #[tokio::test]
    async fn sample_already_queued_is_dropped_once_stream_closes_mid_delivery() {
        let dispatcher = EventDispatcher::new(StreamLayout::default());
        let closer = Arc::new(Closer {
            dispatcher: dispatcher.clone(),
            seen: AtomicU64::new(0),
        });
        let r = Arc::new(Recorder::default());
        let _s1 = dispatcher.subscribe(&closer, Interest::DATA);
        let _s2 = dispatcher.subscribe(&r, Interest::DATA);

        dispatcher.open_stream();
        dispatcher.on_data_received(&eeg(1.0));
        dispatcher.on_data_received(&eeg(2.0));
        settle().await;

        assert_eq!(closer.seen.load(Ordering::SeqCst), 1);
        assert!(r.samples.lock().is_empty());
        assert_eq!(dispatcher.stats().dropped_packets(), 3);
    }

    struct SelfRemoving {
        subscription: Mutex<Option<Subscription>>,
        seen: AtomicU64,
    }

    impl SessionListener for SelfRemoving {
        fn on_sample_received(&self, _sample: &Sample) -> ListenerResult {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = self.subscription.lock().as_ref() {
                sub.unsubscribe();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn unsubscribe_from_inside_callback() {
        let dispatcher = EventDispatcher::new(StreamLayout::default());
        let listener = Arc::new(SelfRemoving {
            subscription: Mutex::new(None),
            seen: AtomicU64::new(0),
        });
        let sub = dispatcher.subscribe(&listener, Interest::DATA);
        *listener.subscription.lock() = Some(sub);

        dispatcher.open_stream();
        for t in 0..5 {
            dispatcher.on_data_received(&eeg(t as f64));
        }
        settle().await;

        assert_eq!(listener.seen.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.listener_count(), 0);
        assert!(!listener.subscription.lock().as_ref().unwrap().is_active());
    }

    #[tokio::test]
    async fn channel_listener_forwards_events() {
        let dispatcher = EventDispatcher::new(StreamLayout::default());
        let (listener, mut rx) = ChannelListener::new();
        let _s = dispatcher.subscribe(&listener, Interest::ALL);

        let err = SessionError::invalid(crate::error::Operation::StartStreaming, ConnectionState::Idle);
        dispatcher.on_command_rejected(&err);
        dispatcher.open_stream();
        dispatcher.on_data_received(&eeg(100.0));

        assert_eq!(rx.recv().await, Some(SessionEvent::CommandRejected(err)));
        match rx.recv().await {
            Some(SessionEvent::Sample(s)) => assert_eq!(s.timestamp, 100.0),
            other => panic!("unexpected {other:?}"),
        }
    }
}
