//! The session state machine.
//!
//! [`Session::spawn`] starts one worker task per headset session.  The worker
//! is the only writer of [`ConnectionState`]: caller commands, provider
//! callbacks, connect/disconnect outcomes and scan timers all arrive on one
//! unbounded queue and are applied one at a time, in arrival order.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use headband_session::prelude::*;
//! # use headband_session::sim::{SimConfig, SimulatedProvider};
//! # async fn demo() -> anyhow::Result<()> {
//! let provider = Arc::new(SimulatedProvider::new(SimConfig::default()));
//! let session = Session::spawn(provider, SessionConfig::default());
//!
//! let (listener, mut events) = ChannelListener::new();
//! let _sub = session.subscribe(&listener, Interest::ALL);
//!
//! session.start_scanning().await?;
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::Discovered(device) => session.connect(device).await?,
//!         SessionEvent::StateChanged(c) if c.state == ConnectionState::Connected => {
//!             session.start_streaming().await?
//!         }
//!         SessionEvent::Sample(sample) => println!("{} {:?}", sample.stream, sample.values),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};

use crate::dispatcher::{DispatchStats, EventDispatcher, Interest, SessionListener, Subscription};
use crate::error::{Operation, SessionError, SessionResult};
use crate::protocol::StreamLayout;
use crate::provider::{LinkState, ProviderEvent, ProviderEventSink, RadioLinkProvider, StreamCommand};
use crate::types::{ConnectionState, DeviceRecord, StateChange, TransitionReason};

// ── SessionConfig ─────────────────────────────────────────────────────────────

/// Policy knobs for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound on a connect attempt before the session gives up with
    /// [`TransitionReason::Timeout`].  Default: 10 s.
    pub connect_timeout: Duration,
    /// How long a requested teardown may take before `Disconnected` is
    /// forced.  Default: 3 s.
    pub disconnect_grace: Duration,
    /// Upper bound on the provider calls the worker waits for inline
    /// (discovery start/stop and stream commands).  A call that overruns
    /// fails with [`SessionError::Provider`] and the queue moves on.
    /// Default: 5 s.
    pub command_timeout: Duration,
    /// Scans still running after this long return to `Idle`.  `None` scans
    /// until stopped.  Default: 30 s.
    pub scan_timeout: Option<Duration>,
    /// Discoveries whose advertised name does not start with this are
    /// ignored.  Empty accepts everything.  Default: `"Muse"`.
    pub name_prefix: String,
    /// Ask the headset for the AUX electrode (5-channel EEG).  Default: `false`.
    pub enable_aux: bool,
    /// Ask the headset for the optical (PPG) channels.  Default: `false`.
    pub enable_ppg: bool,
    /// Channel counts used to validate frames.  Default: 4-channel EEG.
    pub layout: StreamLayout,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            disconnect_grace: Duration::from_secs(3),
            command_timeout: Duration::from_secs(5),
            scan_timeout: Some(Duration::from_secs(30)),
            name_prefix: "Muse".into(),
            enable_aux: false,
            enable_ppg: false,
            layout: StreamLayout::default(),
        }
    }
}

impl SessionConfig {
    /// Sets `enable_aux` and widens the EEG layout to match.
    pub fn with_aux(mut self, enable_aux: bool) -> Self {
        self.enable_aux = enable_aux;
        self.layout.eeg = StreamLayout::classic(enable_aux).eeg;
        self
    }
}

// ── Published state ───────────────────────────────────────────────────────────

/// What [`SessionHandle::watch`] publishes after every committed transition.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    /// The device the session is bound to, or was last bound to.
    pub device: Option<DeviceRecord>,
}

// ── Worker messages ───────────────────────────────────────────────────────────

#[derive(Debug)]
enum Command {
    StartScanning,
    StopScanning,
    Connect(DeviceRecord),
    ConnectTo(String),
    Disconnect,
    StartStreaming,
    StopStreaming,
    Reset,
    Shutdown,
}

#[derive(Debug)]
enum ConnectOutcome {
    Linked,
    Failed(String),
    TimedOut,
}

#[derive(Debug)]
enum TeardownOutcome {
    Confirmed,
    Failed(String),
    GraceElapsed,
}

#[derive(Debug)]
enum Message {
    Command {
        command: Command,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    Provider(ProviderEvent),
    Connect {
        attempt: u64,
        outcome: ConnectOutcome,
    },
    Teardown {
        attempt: u64,
        outcome: TeardownOutcome,
    },
    ScanElapsed {
        scan: u64,
    },
}

/// Run one inline provider call, giving up after `limit`.
async fn bounded<F>(limit: Duration, what: &str, call: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| anyhow::anyhow!("{what} did not complete within {limit:?}"))?
}

fn post(tx: &mpsc::WeakUnboundedSender<Message>, message: Message) {
    if let Some(tx) = tx.upgrade() {
        let _ = tx.send(message);
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Entry point: spawns the worker that owns one session.
pub struct Session;

impl Session {
    /// Attach `provider` to a new session worker and return its handle.
    ///
    /// Must be called from within a tokio runtime.  The worker runs until
    /// [`SessionHandle::shutdown`] is called or every handle is dropped.
    pub fn spawn(provider: Arc<dyn RadioLinkProvider>, config: SessionConfig) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionSnapshot {
            state: ConnectionState::Idle,
            device: None,
        });
        let dispatcher = EventDispatcher::new(config.layout);

        provider.attach(ProviderEventSink::forwarding(tx.downgrade(), Message::Provider));

        let handle = SessionHandle {
            tx: tx.clone(),
            state: state_rx,
            dispatcher: dispatcher.clone(),
            connect_timeout: config.connect_timeout,
        };

        let worker = Worker {
            provider,
            config,
            dispatcher,
            tx: tx.downgrade(),
            published: state_tx,
            state: ConnectionState::Idle,
            device: None,
            known: HashMap::new(),
            seen: HashSet::new(),
            scan: 0,
            connect_attempt: 0,
            pending_connect: None,
            teardown_attempt: 0,
            pending_teardown: None,
        };
        drop(tx);
        tokio::spawn(worker.run(rx));
        handle
    }
}

// ── SessionHandle ─────────────────────────────────────────────────────────────

/// Cloneable handle to a running session.
///
/// Every command resolves once the worker has applied it: `Ok` means the
/// command was accepted and its immediate transition committed, not that a
/// connect or disconnect has completed.  Watch state changes (listener or
/// [`wait_for_state`](Self::wait_for_state)) for that.  Rejected commands
/// are also reported to connection listeners.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Message>,
    state: watch::Receiver<SessionSnapshot>,
    dispatcher: EventDispatcher,
    connect_timeout: Duration,
}

impl SessionHandle {
    async fn send(&self, command: Command) -> SessionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Command { command, reply })
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Begin discovery.  A no-op while already scanning.
    pub async fn start_scanning(&self) -> SessionResult<()> {
        self.send(Command::StartScanning).await
    }

    /// End discovery and return to `Idle`.  A no-op unless scanning.
    pub async fn stop_scanning(&self) -> SessionResult<()> {
        self.send(Command::StopScanning).await
    }

    /// Connect to `device`.  Allowed from `Idle` or `Scanning`.
    pub async fn connect(&self, device: DeviceRecord) -> SessionResult<()> {
        self.send(Command::Connect(device)).await
    }

    /// Connect to a device discovered earlier in this session, by address.
    pub async fn connect_to(&self, address: impl Into<String>) -> SessionResult<()> {
        self.send(Command::ConnectTo(address.into())).await
    }

    /// Tear down the link.  A no-op while already disconnecting.
    pub async fn disconnect(&self) -> SessionResult<()> {
        self.send(Command::Disconnect).await
    }

    pub async fn start_streaming(&self) -> SessionResult<()> {
        self.send(Command::StartStreaming).await
    }

    pub async fn stop_streaming(&self) -> SessionResult<()> {
        self.send(Command::StopStreaming).await
    }

    /// Return from `Disconnected` or `Failed` to `Idle`, forgetting the device.
    pub async fn reset(&self) -> SessionResult<()> {
        self.send(Command::Reset).await
    }

    /// Tear down any link and stop the worker.  Later commands fail with
    /// [`SessionError::Closed`].
    pub async fn shutdown(&self) -> SessionResult<()> {
        self.send(Command::Shutdown).await
    }

    pub fn subscribe<L>(&self, listener: &Arc<L>, interest: Interest) -> Subscription
    where
        L: SessionListener + 'static,
    {
        self.dispatcher.subscribe(listener, interest)
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().state
    }

    pub fn device(&self) -> Option<DeviceRecord> {
        self.state.borrow().device.clone()
    }

    /// A receiver of the latest published snapshot.  Intermediate states can
    /// be skipped; subscribe a listener to observe every transition.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    /// Resolve once `target` is the published state (immediately if it
    /// already is).
    pub async fn wait_for_state(&self, target: ConnectionState) -> SessionResult<()> {
        let mut rx = self.state.clone();
        rx.wait_for(|snapshot| snapshot.state == target)
            .await
            .map(|_| ())
            .map_err(|_| SessionError::Closed)
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        self.dispatcher.stats()
    }

    /// The configured connect timeout, for turning a `Failed` change into an
    /// error via [`StateChange::error`].
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// `true` once the worker has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

struct Worker {
    provider: Arc<dyn RadioLinkProvider>,
    config: SessionConfig,
    dispatcher: EventDispatcher,
    tx: mpsc::WeakUnboundedSender<Message>,
    published: watch::Sender<SessionSnapshot>,

    state: ConnectionState,
    device: Option<DeviceRecord>,
    /// Every matching device discovered in this session, by address.
    known: HashMap<String, DeviceRecord>,
    /// Addresses already reported during the current scan.
    seen: HashSet<String>,
    scan: u64,
    connect_attempt: u64,
    pending_connect: Option<u64>,
    teardown_attempt: u64,
    pending_teardown: Option<u64>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        debug!("session worker started");
        while let Some(message) = rx.recv().await {
            match message {
                Message::Command {
                    command: Command::Shutdown,
                    reply,
                } => {
                    self.shutdown().await;
                    let _ = reply.send(Ok(()));
                    rx.close();
                    debug!("session worker stopped");
                    return;
                }
                Message::Command { command, reply } => {
                    let result = self.apply(command).await;
                    if let Err(err) = &result {
                        debug!("command rejected: {err}");
                        self.dispatcher.on_command_rejected(err);
                    }
                    let _ = reply.send(result);
                }
                Message::Provider(event) => self.on_provider_event(event),
                Message::Connect { attempt, outcome } => self.on_connect_outcome(attempt, outcome),
                Message::Teardown { attempt, outcome } => self.on_teardown_outcome(attempt, outcome),
                Message::ScanElapsed { scan } => self.on_scan_elapsed(scan).await,
            }
        }
        // Every handle is gone.
        self.shutdown().await;
        debug!("session worker stopped");
    }

    /// Commit a transition: publish it, then notify listeners.
    fn commit(&mut self, next: ConnectionState, reason: TransitionReason) {
        let previous = self.state;
        if next == ConnectionState::Streaming {
            self.dispatcher.open_stream();
        } else {
            self.dispatcher.close_stream();
        }
        self.state = next;
        self.published.send_replace(SessionSnapshot {
            state: next,
            device: self.device.clone(),
        });
        info!("{previous} → {next} ({reason})");
        self.dispatcher.on_connection_changed(&StateChange {
            previous,
            state: next,
            device: self.device.clone(),
            reason: Some(reason),
        });
    }

    fn bound_address(&self) -> Option<&str> {
        self.device.as_ref().map(|d| d.address.as_str())
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    async fn apply(&mut self, command: Command) -> SessionResult<()> {
        use ConnectionState::*;

        match command {
            Command::StartScanning => match self.state {
                Scanning => Ok(()),
                Idle | Disconnected | Failed => self.start_scanning().await,
                state => Err(SessionError::invalid(Operation::StartScanning, state)),
            },
            Command::StopScanning => {
                if self.state == Scanning {
                    self.end_discovery().await;
                    self.commit(Idle, TransitionReason::Requested);
                }
                Ok(())
            }
            Command::Connect(device) => {
                self.check_can_connect()?;
                self.connect(device).await;
                Ok(())
            }
            Command::ConnectTo(address) => {
                self.check_can_connect()?;
                let device = self
                    .known
                    .get(&address)
                    .cloned()
                    .ok_or(SessionError::UnknownDevice(address))?;
                self.connect(device).await;
                Ok(())
            }
            Command::Disconnect => match self.state {
                Disconnecting => Ok(()),
                Connecting | Connected | Streaming => {
                    self.disconnect();
                    Ok(())
                }
                state => Err(SessionError::invalid(Operation::Disconnect, state)),
            },
            Command::StartStreaming => match self.state {
                Connected => {
                    let start = StreamCommand::Start {
                        enable_aux: self.config.enable_aux,
                        enable_ppg: self.config.enable_ppg,
                    };
                    bounded(self.config.command_timeout, "start command", self.provider.send(start))
                        .await
                        .map_err(|e| SessionError::Provider(format!("{e:#}")))?;
                    self.commit(Streaming, TransitionReason::Requested);
                    Ok(())
                }
                state => Err(SessionError::invalid(Operation::StartStreaming, state)),
            },
            Command::StopStreaming => match self.state {
                Streaming => {
                    self.commit(Connected, TransitionReason::Requested);
                    let stop = self.provider.send(StreamCommand::Stop);
                    if let Err(e) = bounded(self.config.command_timeout, "stop command", stop).await {
                        warn!("stop command failed: {e:#}");
                    }
                    Ok(())
                }
                state => Err(SessionError::invalid(Operation::StopStreaming, state)),
            },
            Command::Reset => match self.state {
                Idle => Ok(()),
                Disconnected | Failed => {
                    self.device = None;
                    self.commit(Idle, TransitionReason::Requested);
                    Ok(())
                }
                state => Err(SessionError::invalid(Operation::Reset, state)),
            },
            Command::Shutdown => Ok(()),
        }
    }

    async fn start_scanning(&mut self) -> SessionResult<()> {
        bounded(self.config.command_timeout, "discovery start", self.provider.begin_discovery())
            .await
            .map_err(|e| SessionError::Provider(format!("{e:#}")))?;

        self.scan += 1;
        self.seen.clear();
        self.device = None;
        self.commit(ConnectionState::Scanning, TransitionReason::Requested);

        if let Some(after) = self.config.scan_timeout {
            let tx = self.tx.clone();
            let scan = self.scan;
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                post(&tx, Message::ScanElapsed { scan });
            });
        }
        Ok(())
    }

    async fn end_discovery(&self) {
        let end = self.provider.end_discovery();
        if let Err(e) = bounded(self.config.command_timeout, "discovery stop", end).await {
            warn!("ending discovery failed: {e:#}");
        }
    }

    fn check_can_connect(&self) -> SessionResult<()> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Scanning => Ok(()),
            state => Err(SessionError::invalid(Operation::Connect, state)),
        }
    }

    async fn connect(&mut self, device: DeviceRecord) {
        if self.state == ConnectionState::Scanning {
            self.end_discovery().await;
        }

        self.connect_attempt += 1;
        let attempt = self.connect_attempt;
        self.pending_connect = Some(attempt);
        self.known.insert(device.address.clone(), device.clone());
        let address = device.address.clone();
        self.device = Some(device);
        self.commit(ConnectionState::Connecting, TransitionReason::Requested);

        let provider = Arc::clone(&self.provider);
        let tx = self.tx.clone();
        let limit = self.config.connect_timeout;
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(limit, provider.connect(&address, limit)).await {
                Ok(Ok(())) => ConnectOutcome::Linked,
                Ok(Err(e)) => ConnectOutcome::Failed(format!("{e:#}")),
                Err(_) => ConnectOutcome::TimedOut,
            };
            post(&tx, Message::Connect { attempt, outcome });
        });
    }

    fn disconnect(&mut self) {
        self.pending_connect = None;
        self.teardown_attempt += 1;
        let attempt = self.teardown_attempt;
        self.pending_teardown = Some(attempt);
        self.commit(ConnectionState::Disconnecting, TransitionReason::Requested);

        let Some(address) = self.bound_address().map(str::to_owned) else {
            post(
                &self.tx,
                Message::Teardown {
                    attempt,
                    outcome: TeardownOutcome::Confirmed,
                },
            );
            return;
        };
        let provider = Arc::clone(&self.provider);
        let tx = self.tx.clone();
        let grace = self.config.disconnect_grace;
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(grace, provider.disconnect(&address)).await {
                Ok(Ok(())) => TeardownOutcome::Confirmed,
                Ok(Err(e)) => TeardownOutcome::Failed(format!("{e:#}")),
                Err(_) => TeardownOutcome::GraceElapsed,
            };
            post(&tx, Message::Teardown { attempt, outcome });
        });
    }

    async fn shutdown(&mut self) {
        match self.state {
            ConnectionState::Scanning => {
                self.end_discovery().await;
                self.commit(ConnectionState::Idle, TransitionReason::Requested);
            }
            state if state.has_link() => {
                self.dispatcher.close_stream();
                if let Some(address) = self.bound_address().map(str::to_owned) {
                    let grace = self.config.disconnect_grace;
                    match tokio::time::timeout(grace, self.provider.disconnect(&address)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("teardown of {address} on shutdown failed: {e:#}"),
                        Err(_) => warn!("teardown of {address} on shutdown timed out"),
                    }
                }
                self.commit(ConnectionState::Disconnected, TransitionReason::Requested);
            }
            _ => {}
        }
    }

    // ── Asynchronous outcomes ─────────────────────────────────────────────────

    fn on_connect_outcome(&mut self, attempt: u64, outcome: ConnectOutcome) {
        if self.pending_connect != Some(attempt) || self.state != ConnectionState::Connecting {
            debug!("ignoring stale connect outcome #{attempt}: {outcome:?}");
            return;
        }
        self.pending_connect = None;

        match outcome {
            ConnectOutcome::Linked => self.commit(ConnectionState::Connected, TransitionReason::Requested),
            ConnectOutcome::Failed(reason) => {
                self.commit(ConnectionState::Failed, TransitionReason::ProviderError(reason))
            }
            ConnectOutcome::TimedOut => {
                self.commit(ConnectionState::Failed, TransitionReason::Timeout);
                // The provider may still be negotiating; ask it to stop.
                if let Some(address) = self.bound_address().map(str::to_owned) {
                    let provider = Arc::clone(&self.provider);
                    let grace = self.config.disconnect_grace;
                    tokio::spawn(async move {
                        match tokio::time::timeout(grace, provider.disconnect(&address)).await {
                            Ok(Ok(())) => debug!("abandoned link to {address} torn down"),
                            Ok(Err(e)) => debug!("teardown after connect timeout failed: {e:#}"),
                            Err(_) => debug!("teardown after connect timeout did not finish"),
                        }
                    });
                }
            }
        }
    }

    fn on_teardown_outcome(&mut self, attempt: u64, outcome: TeardownOutcome) {
        if self.pending_teardown != Some(attempt) || self.state != ConnectionState::Disconnecting {
            debug!("ignoring stale teardown outcome #{attempt}: {outcome:?}");
            return;
        }
        self.pending_teardown = None;

        let reason = match outcome {
            TeardownOutcome::Confirmed => TransitionReason::Requested,
            TeardownOutcome::Failed(reason) => TransitionReason::ProviderError(reason),
            TeardownOutcome::GraceElapsed => {
                warn!("teardown not confirmed within {:?}; forcing disconnected", self.config.disconnect_grace);
                TransitionReason::GraceElapsed
            }
        };
        self.commit(ConnectionState::Disconnected, reason);
    }

    async fn on_scan_elapsed(&mut self, scan: u64) {
        if scan != self.scan || self.state != ConnectionState::Scanning {
            return;
        }
        info!("scan stopped after {:?}", self.config.scan_timeout.unwrap_or_default());
        self.end_discovery().await;
        self.commit(ConnectionState::Idle, TransitionReason::ScanTimeout);
    }

    // ── Provider events ───────────────────────────────────────────────────────

    fn on_provider_event(&mut self, event: ProviderEvent) {
        match event {
            ProviderEvent::PeripheralDiscovered(device) => self.on_discovered(device),
            ProviderEvent::LinkStateChanged { address, state } => {
                if self.bound_address() != Some(address.as_str()) {
                    debug!("ignoring link state {state:?} for unbound {address}");
                    return;
                }
                match state {
                    LinkState::Connected => self.on_link_up(),
                    LinkState::Disconnected => self.on_link_down(),
                }
            }
            ProviderEvent::PacketReceived { address, packet } => {
                if self.state == ConnectionState::Streaming
                    && self.bound_address() == Some(address.as_str())
                {
                    self.dispatcher.on_data_received(&packet);
                } else {
                    self.dispatcher.stats().record_dropped();
                }
            }
        }
    }

    fn on_discovered(&mut self, device: DeviceRecord) {
        if self.state != ConnectionState::Scanning {
            return;
        }
        if !device.name.starts_with(&self.config.name_prefix) {
            debug!("ignoring {device}: name does not match {:?}", self.config.name_prefix);
            return;
        }
        self.known.insert(device.address.clone(), device.clone());
        if self.seen.insert(device.address.clone()) {
            info!("discovered {device}");
            self.dispatcher.on_discovered(&device);
        }
    }

    fn on_link_up(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.pending_connect = None;
            self.commit(ConnectionState::Connected, TransitionReason::Requested);
        }
    }

    fn on_link_down(&mut self) {
        match self.state {
            ConnectionState::Connecting => {
                self.pending_connect = None;
                self.commit(
                    ConnectionState::Failed,
                    TransitionReason::ProviderError("link dropped while connecting".into()),
                );
            }
            ConnectionState::Connected | ConnectionState::Streaming => {
                warn!("link to {} dropped", self.bound_address().unwrap_or("?"));
                self.commit(ConnectionState::Disconnected, TransitionReason::Unexpected);
            }
            ConnectionState::Disconnecting => {
                self.pending_teardown = None;
                self.commit(ConnectionState::Disconnected, TransitionReason::Requested);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{ChannelListener, SessionEvent};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Provider whose calls always succeed, except where a flag says otherwise.
    #[derive(Default)]
    struct Stub {
        sink: Mutex<Option<ProviderEventSink>>,
        fail_discovery: bool,
        hang_discovery: bool,
        fail_start: bool,
        calls: Mutex<Vec<String>>,
    }

    impl Stub {
        fn sink(&self) -> ProviderEventSink {
            self.sink.lock().clone().unwrap()
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl RadioLinkProvider for Stub {
        fn attach(&self, events: ProviderEventSink) {
            *self.sink.lock() = Some(events);
        }

        async fn begin_discovery(&self) -> anyhow::Result<()> {
            self.calls.lock().push("begin".into());
            if self.fail_discovery {
                return Err(anyhow!("adapter powered off"));
            }
            if self.hang_discovery {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn end_discovery(&self) -> anyhow::Result<()> {
            self.calls.lock().push("end".into());
            Ok(())
        }

        async fn connect(&self, address: &str, _timeout: Duration) -> anyhow::Result<()> {
            self.calls.lock().push(format!("connect {address}"));
            Ok(())
        }

        async fn disconnect(&self, address: &str) -> anyhow::Result<()> {
            self.calls.lock().push(format!("disconnect {address}"));
            Ok(())
        }

        async fn send(&self, command: StreamCommand) -> anyhow::Result<()> {
            self.calls.lock().push(format!("{command:?}"));
            if self.fail_start && command != StreamCommand::Stop {
                return Err(anyhow!("write failed"));
            }
            Ok(())
        }
    }

    fn muse_a() -> DeviceRecord {
        DeviceRecord::new("MuseA", "AA:BB:CC")
    }

    #[tokio::test(start_paused = true)]
    async fn scanning_commands_follow_the_table() {
        let stub = Arc::new(Stub::default());
        let session = Session::spawn(stub.clone(), SessionConfig::default());

        // Stopping while idle is a no-op, not an error.
        session.stop_scanning().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Idle);

        session.start_scanning().await.unwrap();
        session.start_scanning().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Scanning);
        assert_eq!(stub.calls(), vec!["begin"]);

        session.stop_scanning().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Idle);
        assert_eq!(stub.calls(), vec!["begin", "end"]);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_failure_leaves_state_unchanged() {
        let stub = Arc::new(Stub {
            fail_discovery: true,
            ..Stub::default()
        });
        let session = Session::spawn(stub, SessionConfig::default());

        let err = session.start_scanning().await.unwrap_err();
        assert!(matches!(err, SessionError::Provider(ref m) if m.contains("powered off")));
        assert_eq!(session.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_discovery_start_times_out() {
        let stub = Arc::new(Stub {
            hang_discovery: true,
            ..Stub::default()
        });
        let config = SessionConfig {
            command_timeout: Duration::from_secs(2),
            ..SessionConfig::default()
        };
        let session = Session::spawn(stub.clone(), config);

        let started = tokio::time::Instant::now();
        let err = session.start_scanning().await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(matches!(err, SessionError::Provider(ref m) if m.contains("discovery start")));
        assert_eq!(session.state(), ConnectionState::Idle);

        // The worker is free again.
        session.connect(muse_a()).await.unwrap();
        session.wait_for_state(ConnectionState::Connected).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn discoveries_are_filtered_and_deduplicated() {
        let stub = Arc::new(Stub::default());
        let session = Session::spawn(stub.clone(), SessionConfig::default());
        let (listener, mut rx) = ChannelListener::new();
        let _sub = session.subscribe(&listener, Interest::DISCOVERY);

        // Before scanning: ignored.
        stub.sink().discovered(muse_a());
        session.start_scanning().await.unwrap();
        stub.sink().discovered(muse_a());
        stub.sink().discovered(DeviceRecord::new("Fitbit", "11:22:33"));
        stub.sink().discovered(DeviceRecord::new("MuseA renamed", "AA:BB:CC"));
        stub.sink().discovered(DeviceRecord::new("MuseB", "DD:EE:FF"));
        session.stop_scanning().await.unwrap();

        assert_eq!(rx.recv().await, Some(SessionEvent::Discovered(muse_a())));
        match rx.recv().await {
            Some(SessionEvent::Discovered(d)) => assert_eq!(d.address, "DD:EE:FF"),
            other => panic!("unexpected {other:?}"),
        }

        // A fresh scan reports the same device again.
        session.start_scanning().await.unwrap();
        stub.sink().discovered(muse_a());
        assert!(matches!(rx.recv().await, Some(SessionEvent::Discovered(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn scan_stops_itself_after_timeout() {
        let stub = Arc::new(Stub::default());
        let config = SessionConfig {
            scan_timeout: Some(Duration::from_secs(5)),
            ..SessionConfig::default()
        };
        let session = Session::spawn(stub.clone(), config);
        let (listener, mut rx) = ChannelListener::new();
        let _sub = session.subscribe(&listener, Interest::CONNECTION);

        session.start_scanning().await.unwrap();
        session.wait_for_state(ConnectionState::Idle).await.unwrap();

        let _scanning = rx.recv().await;
        match rx.recv().await {
            Some(SessionEvent::StateChanged(change)) => {
                assert_eq!(change.state, ConnectionState::Idle);
                assert_eq!(change.reason, Some(TransitionReason::ScanTimeout));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(stub.calls(), vec!["begin", "end"]);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_to_requires_a_known_address() {
        let stub = Arc::new(Stub::default());
        let session = Session::spawn(stub.clone(), SessionConfig::default());

        session.start_scanning().await.unwrap();
        let err = session.connect_to("AA:BB:CC").await.unwrap_err();
        assert_eq!(err, SessionError::UnknownDevice("AA:BB:CC".into()));

        stub.sink().discovered(muse_a());
        session.connect_to("AA:BB:CC").await.unwrap();
        session.wait_for_state(ConnectionState::Connected).await.unwrap();
        assert_eq!(session.device(), Some(muse_a()));
        assert_eq!(stub.calls(), vec!["begin", "end", "connect AA:BB:CC"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_stream_start_stays_connected() {
        let stub = Arc::new(Stub {
            fail_start: true,
            ..Stub::default()
        });
        let session = Session::spawn(stub, SessionConfig::default());
        let (listener, mut rx) = ChannelListener::new();
        let _sub = session.subscribe(&listener, Interest::CONNECTION);

        session.connect(muse_a()).await.unwrap();
        session.wait_for_state(ConnectionState::Connected).await.unwrap();

        let err = session.start_streaming().await.unwrap_err();
        assert!(matches!(err, SessionError::Provider(_)));
        assert_eq!(session.state(), ConnectionState::Connected);

        // Connecting, Connected, then the rejection.
        let _ = rx.recv().await;
        let _ = rx.recv().await;
        assert_eq!(rx.recv().await, Some(SessionEvent::CommandRejected(err)));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_returns_to_idle_from_terminal_states_only() {
        let stub = Arc::new(Stub::default());
        let session = Session::spawn(stub, SessionConfig::default());

        session.reset().await.unwrap();
        session.connect(muse_a()).await.unwrap();
        session.wait_for_state(ConnectionState::Connected).await.unwrap();

        let err = session.reset().await.unwrap_err();
        assert_eq!(err, SessionError::invalid(Operation::Reset, ConnectionState::Connected));

        session.disconnect().await.unwrap();
        session.wait_for_state(ConnectionState::Disconnected).await.unwrap();
        assert_eq!(session.device(), Some(muse_a()));

        session.reset().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Idle);
        assert_eq!(session.device(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_tears_down_and_closes() {
        let stub = Arc::new(Stub::default());
        let session = Session::spawn(stub.clone(), SessionConfig::default());

        session.connect(muse_a()).await.unwrap();
        session.wait_for_state(ConnectionState::Connected).await.unwrap();
        session.shutdown().await.unwrap();

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(stub.calls().contains(&"disconnect AA:BB:CC".to_string()));
        assert_eq!(session.start_scanning().await, Err(SessionError::Closed));
        assert!(session.is_closed());
    }

    #[test]
    fn aux_config_widens_layout() {
        let config = SessionConfig::default().with_aux(true);
        assert!(config.enable_aux);
        assert_eq!(config.layout.eeg, 5);
        assert_eq!(SessionConfig::default().layout.eeg, 4);
    }
}
