//! The command/response engine.
//!
//! One [`Engine`] task owns every piece of mutable state: the correlation
//! queues, the ledger, the timers, the homing tracker and the published
//! snapshots.  Everything else talks to it through an [`EngineHandle`]:
//!
//! ```text
//!  EngineHandle ──requests──►┐
//!  transport  ──TransportEvent──►  Engine task ──watch──► subscribers
//!  writer / timers / fetch ──internal──►┘
//! ```
//!
//! Transport callbacks never touch state directly; they post into one of the
//! engine's inboxes and the engine applies them in arrival order.
//!
//! # Submission styles
//!
//! | Method | Suspends | Result |
//! |---|---|---|
//! | [`EngineHandle::send`] | no | fire-and-forget |
//! | [`EngineHandle::send_with`] | no | callback, fired at most once |
//! | [`EngineHandle::request`] | yes | background queue, waits for the reply |
//! | [`EngineHandle::send_awaited`] | yes | exclusive awaited slot |
//!
//! All four go through the same [`Completion`] primitive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::catalog::{fallback_catalog, fetch_catalog};
use crate::correlation::{Completion, CorrelationQueues, WriteAck};
use crate::error::{Error, Result};
use crate::homing::HomingTracker;
use crate::ledger::{CommandLedger, DEFAULT_LEDGER_CAPACITY};
use crate::parse::decode_state;
use crate::protocol::{
    classify_response, decode_text, encode_knob_config, parse_knob_config, Command, Endpoint,
    Page, Parameter, ResponseKind, DEFAULT_AWAITED_TIMEOUT, DEFAULT_IO_TIMEOUT,
    DEFAULT_RESPONSE_TIMEOUT,
};
use crate::settings::{SettingsStore, SPEED_KNOB_AS_LIMIT};
use crate::simulator::simulate;
use crate::transport::{read_endpoint, write_endpoint, Cancellation, Transport, TransportEvent};
use crate::types::{
    CommandEvent, CommandOutcome, ConnectionState, DeviceState, EventId, HomingProgress,
    PatternEntry, RootStatus, TransportResult,
};

// ── EngineConfig ──────────────────────────────────────────────────────────────

/// Configuration for [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a background command waits for its response. Default: 2 s.
    pub response_timeout: Duration,
    /// Awaited-command window when the caller passes none. Default: 2 s.
    pub awaited_timeout: Duration,
    /// Bound on each individual transport read or write. Default: 2 s.
    pub io_timeout: Duration,
    /// Number of ledger entries kept for diagnostics. Default: 64.
    pub ledger_capacity: usize,
    /// Start in debug/simulation mode, bypassing the transport. Default: `false`.
    pub simulation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            awaited_timeout: DEFAULT_AWAITED_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
            simulation: false,
        }
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// How a submission enters the correlation queues.
#[derive(Debug, Clone, Copy)]
enum Admission {
    Background,
    /// Through the awaited slot, with this response window.
    Awaited(Duration),
    /// Background, but admitted while an awaited command is outstanding.
    Urgent,
}

enum Request {
    Submit {
        command: Command,
        completion: Completion,
        admission: Admission,
        reply: oneshot::Sender<Result<EventId>>,
    },
    Attach {
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
    },
    Disconnect(oneshot::Sender<()>),
    RefreshPatterns,
    SetSimulation(bool),
    SetSpeedKnobLimit {
        as_limit: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    LedgerSnapshot(oneshot::Sender<Vec<CommandEvent>>),
    ReportError(String),
    DismissError,
}

/// Results posted back by tasks the engine spawned.  Every link-scoped
/// message carries the link generation so stale results are dropped.
enum Internal {
    WriteCompleted {
        link: u64,
        result: std::result::Result<(), String>,
    },
    ResponseTimeout(EventId),
    CatalogFetched {
        generation: u64,
        catalog: Option<Vec<PatternEntry>>,
    },
    KnobConfig {
        link: u64,
        value: Result<Option<bool>>,
    },
    StateRead {
        link: u64,
        bytes: Vec<u8>,
    },
}

enum Step {
    Request(Option<Request>),
    Internal(Internal),
    Transport(Option<TransportEvent>),
}

// ── Publishers ────────────────────────────────────────────────────────────────

struct Publishers {
    connection: watch::Sender<ConnectionState>,
    state: watch::Sender<DeviceState>,
    root: watch::Sender<RootStatus>,
    patterns: watch::Sender<Vec<PatternEntry>>,
    error: watch::Sender<Option<String>>,
    homing: watch::Sender<Option<HomingProgress>>,
    knob: watch::Sender<Option<bool>>,
}

/// Publish `value` only if it differs from the current one.
fn publish<T: PartialEq>(tx: &watch::Sender<T>, value: T) {
    tx.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    });
}

// ── Link ──────────────────────────────────────────────────────────────────────

/// Everything tied to one attached transport.
struct Link {
    generation: u64,
    transport: Arc<dyn Transport>,
    events: mpsc::Receiver<TransportEvent>,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    writer_task: JoinHandle<()>,
    /// Cancels link-scoped reads and writes on reset.
    cancel: Cancellation,
    /// A state notification arrived; the initial read is stale by now.
    state_notified: bool,
}

impl Link {
    fn close(self) {
        self.cancel.cancel();
        self.writer_task.abort();
    }
}

struct FetchTask {
    generation: u64,
    cancel: Cancellation,
}

async fn next_transport_event(link: &mut Option<Link>) -> Option<TransportEvent> {
    match link {
        Some(link) => link.events.recv().await,
        None => std::future::pending().await,
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// The engine task.  Construct with [`Engine::spawn`].
pub struct Engine {
    config: EngineConfig,
    requests: mpsc::Receiver<Request>,
    internal: mpsc::UnboundedReceiver<Internal>,
    loopback: mpsc::UnboundedSender<Internal>,

    link: Option<Link>,
    link_generation: u64,

    ledger: CommandLedger,
    queues: CorrelationQueues,
    timers: HashMap<EventId, JoinHandle<()>>,

    tracker: HomingTracker,
    settings: Box<dyn SettingsStore>,

    pubs: Publishers,
    state: DeviceState,
    root: RootStatus,
    simulation: bool,

    fetch: Option<FetchTask>,
    fetch_generation: u64,
}

impl Engine {
    /// Spawn the engine on the current tokio runtime and return its handle.
    ///
    /// The engine stops when every [`EngineHandle`] clone has been dropped.
    pub fn spawn(config: EngineConfig, settings: Box<dyn SettingsStore>) -> EngineHandle {
        let (req_tx, req_rx) = mpsc::channel(64);
        let (int_tx, int_rx) = mpsc::unbounded_channel();

        let (connection, connection_rx) = watch::channel(ConnectionState::Disconnected);
        let (state, state_rx) = watch::channel(DeviceState::default());
        let (root, root_rx) = watch::channel(RootStatus::default());
        let (patterns, patterns_rx) = watch::channel(Vec::new());
        let (error, error_rx) = watch::channel(None);
        let (homing, homing_rx) = watch::channel(None);
        let (knob, knob_rx) = watch::channel(None);

        let handle = EngineHandle {
            requests: req_tx,
            awaited_timeout: config.awaited_timeout,
            connection: connection_rx,
            state: state_rx,
            root: root_rx,
            patterns: patterns_rx,
            error: error_rx,
            homing: homing_rx,
            knob: knob_rx,
        };

        let engine = Engine {
            simulation: config.simulation,
            ledger: CommandLedger::new(config.ledger_capacity),
            config,
            requests: req_rx,
            internal: int_rx,
            loopback: int_tx,
            link: None,
            link_generation: 0,
            queues: CorrelationQueues::new(),
            timers: HashMap::new(),
            tracker: HomingTracker::new(),
            settings,
            pubs: Publishers {
                connection,
                state,
                root,
                patterns,
                error,
                homing,
                knob,
            },
            state: DeviceState::default(),
            root: RootStatus::default(),
            fetch: None,
            fetch_generation: 0,
        };
        tokio::spawn(engine.run());
        handle
    }

    async fn run(mut self) {
        info!("engine started (simulation: {})", self.simulation);
        loop {
            let step = tokio::select! {
                req = self.requests.recv() => Step::Request(req),
                Some(msg) = self.internal.recv() => Step::Internal(msg),
                ev = next_transport_event(&mut self.link) => Step::Transport(ev),
            };
            match step {
                Step::Request(Some(req)) => self.on_request(req),
                Step::Request(None) => break,
                Step::Internal(msg) => self.on_internal(msg),
                Step::Transport(Some(ev)) => self.on_transport_event(ev),
                Step::Transport(None) => {
                    warn!("transport event channel closed");
                    self.reset(Error::NotReady, ConnectionState::Disconnected);
                }
            }
        }
        self.reset(Error::EngineStopped, ConnectionState::Disconnected);
        info!("engine stopped");
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    fn on_request(&mut self, req: Request) {
        match req {
            Request::Submit {
                command,
                completion,
                admission,
                reply,
            } => {
                let result = self.submit(command, completion, admission);
                let _ = reply.send(result);
            }
            Request::Attach { transport, events } => self.attach(transport, events),
            Request::Disconnect(reply) => {
                if let Some(link) = &self.link {
                    let transport = Arc::clone(&link.transport);
                    tokio::spawn(async move {
                        if let Err(e) = transport.disconnect().await {
                            warn!("disconnect: {e}");
                        }
                    });
                }
                self.reset(Error::NotReady, ConnectionState::Disconnected);
                let _ = reply.send(());
            }
            Request::RefreshPatterns => self.refresh_patterns(),
            Request::SetSimulation(on) => {
                if on != self.simulation {
                    info!("simulation mode {}", if on { "on" } else { "off" });
                    self.simulation = on;
                    self.refresh_patterns();
                }
            }
            Request::SetSpeedKnobLimit { as_limit, reply } => {
                self.set_speed_knob_limit(as_limit, reply)
            }
            Request::LedgerSnapshot(reply) => {
                let _ = reply.send(self.ledger.snapshot());
            }
            Request::ReportError(message) => self.report_error(message),
            Request::DismissError => publish(&self.pubs.error, None),
        }
    }

    fn submit(
        &mut self,
        command: Command,
        completion: Completion,
        admission: Admission,
    ) -> Result<EventId> {
        let text = command.to_string();

        if self.simulation {
            let id = self.ledger.record(&text);
            self.ledger.set_transport_result(id, TransportResult::Success);
            let (next, response) = simulate(&self.state, &command);
            debug!("sim: {text} -> {response}");
            self.apply_state(next);
            self.finish_response(id, completion, &response);
            return Ok(id);
        }

        let rejection = match &self.link {
            None => Some(Error::NotReady),
            Some(link) if !link.transport.has_endpoint(Endpoint::Command) => Some(
                Error::CharacteristicNotFound(format!("{:?}", Endpoint::Command)),
            ),
            Some(_) => match admission {
                Admission::Background => {
                    self.queues.admit(command.expects_response(), false).err()
                }
                Admission::Awaited(_) => self.queues.admit(true, true).err(),
                Admission::Urgent => None,
            },
        };
        if let Some(e) = rejection {
            debug!("rejecting '{text}': {e}");
            completion.resolve(Err(e.clone()));
            return Err(e);
        }

        let id = self.ledger.record(&text);
        match admission {
            Admission::Awaited(timeout) => self.queues.push_awaited(id, completion, timeout),
            Admission::Background | Admission::Urgent => {
                self.queues
                    .push_background(id, completion, command.expects_response())
            }
        }
        debug!("{id} queued: {text}");

        let sent = self
            .link
            .as_ref()
            .is_some_and(|link| link.writer.send(command.encode()).is_ok());
        if !sent {
            self.on_write_completed(Err("command writer stopped".into()));
        }
        Ok(id)
    }

    fn attach(&mut self, transport: Arc<dyn Transport>, events: mpsc::Receiver<TransportEvent>) {
        if self.link.is_some() {
            info!("attach: replacing existing link");
            self.reset(Error::NotReady, ConnectionState::Disconnected);
        }
        self.link_generation += 1;
        let generation = self.link_generation;

        // Commands are written one at a time so acknowledgements come back
        // in submission order.
        let (writer, mut payloads) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer_transport = Arc::clone(&transport);
        let tx = self.loopback.clone();
        let io_timeout = self.config.io_timeout;
        let writer_task = tokio::spawn(async move {
            while let Some(payload) = payloads.recv().await {
                let result = match tokio::time::timeout(
                    io_timeout,
                    writer_transport.write(Endpoint::Command, payload),
                )
                .await
                {
                    Ok(r) => r.map_err(|e| match e {
                        Error::Transport(reason) => reason,
                        other => other.to_string(),
                    }),
                    Err(_) => Err("write timed out".to_owned()),
                };
                if tx
                    .send(Internal::WriteCompleted {
                        link: generation,
                        result,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });

        self.link = Some(Link {
            generation,
            transport,
            events,
            writer,
            writer_task,
            cancel: Cancellation::new(),
            state_notified: false,
        });
        publish(&self.pubs.connection, ConnectionState::Connecting);
        info!("transport attached (link {generation})");
    }

    // ── Internal results ──────────────────────────────────────────────────────

    fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::WriteCompleted { link, result } => {
                if self.is_current_link(link) {
                    self.on_write_completed(result);
                } else {
                    debug!("dropping write ack from stale link {link}");
                }
            }
            Internal::ResponseTimeout(id) => self.on_response_timeout(id),
            Internal::CatalogFetched {
                generation,
                catalog,
            } => {
                let current = self
                    .fetch
                    .as_ref()
                    .is_some_and(|f| f.generation == generation);
                if !current {
                    debug!("dropping stale catalog fetch {generation}");
                    return;
                }
                self.fetch = None;
                match catalog {
                    Some(c) => {
                        info!("catalog: {} pattern(s)", c.len());
                        publish(&self.pubs.patterns, c);
                    }
                    None => debug!("catalog fetch {generation} cancelled"),
                }
            }
            Internal::KnobConfig { link, value } => {
                if !self.is_current_link(link) {
                    return;
                }
                match value {
                    Ok(Some(v)) => publish(&self.pubs.knob, Some(v)),
                    Ok(None) => warn!("speed knob config: unrecognised value"),
                    Err(e) => warn!("speed knob config: {e}"),
                }
            }
            Internal::StateRead { link, bytes } => {
                if !self.is_current_link(link) {
                    return;
                }
                if self.link.as_ref().is_some_and(|l| l.state_notified) {
                    debug!("initial state read superseded by a notification");
                    return;
                }
                self.on_state_bytes(&bytes);
            }
        }
    }

    fn is_current_link(&self, generation: u64) -> bool {
        self.link.as_ref().is_some_and(|l| l.generation == generation)
    }

    fn on_write_completed(&mut self, result: std::result::Result<(), String>) {
        match self.queues.on_write_completed(result) {
            WriteAck::Unexpected => warn!("write ack with no pending write"),
            WriteAck::Completed { id, completion } => {
                self.ledger.set_transport_result(id, TransportResult::Success);
                self.ledger.resolve(id, CommandOutcome::Succeeded, None);
                completion.resolve(Ok(String::new()));
            }
            WriteAck::AwaitingResponse { id } => {
                self.ledger.set_transport_result(id, TransportResult::Success);
                self.arm_timer(id, self.config.response_timeout);
            }
            WriteAck::AwaitedWritten { id, timeout } => {
                self.ledger.set_transport_result(id, TransportResult::Success);
                self.arm_timer(id, timeout);
            }
            WriteAck::AwaitedAlreadyResolved { id } => {
                self.ledger.set_transport_result(id, TransportResult::Success);
            }
            WriteAck::Failed {
                id,
                completion,
                reason,
            } => {
                warn!("{id} write failed: {reason}");
                self.ledger
                    .set_transport_result(id, TransportResult::Failure(reason.clone()));
                self.ledger.resolve(id, CommandOutcome::TransportFailed, None);
                let err = Error::Transport(reason);
                self.report_error(err.to_string());
                completion.resolve(Err(err));
            }
        }
    }

    fn arm_timer(&mut self, id: EventId, after: Duration) {
        let tx = self.loopback.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(Internal::ResponseTimeout(id));
        });
        if let Some(old) = self.timers.insert(id, timer) {
            old.abort();
        }
    }

    fn cancel_timer(&mut self, id: EventId) {
        if let Some(timer) = self.timers.remove(&id) {
            timer.abort();
        }
    }

    fn on_response_timeout(&mut self, id: EventId) {
        self.timers.remove(&id);
        let Some(target) = self.queues.on_timeout(id) else {
            debug!("{id} timer fired after resolution");
            return;
        };
        warn!(
            "{id} timed out waiting for a response{}",
            if target.awaited { " (awaited)" } else { "" }
        );
        self.ledger.resolve(id, CommandOutcome::TimedOut, None);
        self.report_error(Error::Timeout.to_string());
        target.completion.resolve(Err(Error::Timeout));
    }

    /// Classify a response and resolve `completion` with it.
    fn finish_response(&mut self, id: EventId, completion: Completion, text: &str) {
        let (outcome, result) = match classify_response(text) {
            ResponseKind::Ok => (CommandOutcome::Succeeded, Ok(text.to_owned())),
            ResponseKind::Fail(reason) => (
                CommandOutcome::FirmwareFailed,
                Err(Error::CommandFailed(reason)),
            ),
            ResponseKind::Malformed => (
                CommandOutcome::MalformedResponse,
                Err(Error::InvalidResponse(text.to_owned())),
            ),
        };
        self.ledger.resolve(id, outcome, Some(text.to_owned()));
        if let Err(e) = &result {
            warn!("{id} {e}");
            self.report_error(e.to_string());
        }
        completion.resolve(result);
    }

    // ── Transport events ──────────────────────────────────────────────────────

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(name) => {
                info!("link up: {name}");
                publish(&self.pubs.connection, ConnectionState::Connected(name));
                self.read_initial_state();
                self.sync_speed_knob();
                self.refresh_patterns();
            }
            TransportEvent::Notification { endpoint, value } => match endpoint {
                Endpoint::Command => self.on_command_notification(&value),
                Endpoint::State => {
                    if let Some(link) = self.link.as_mut() {
                        link.state_notified = true;
                    }
                    self.on_state_bytes(&value);
                }
                Endpoint::SpeedKnobConfig => {
                    match parse_knob_config(&decode_text(&value)) {
                        Some(v) => publish(&self.pubs.knob, Some(v)),
                        None => debug!("ignoring knob config notification {value:02x?}"),
                    }
                }
                other => debug!("ignoring notification on {other:?}"),
            },
            TransportEvent::Disconnected => {
                info!("link lost");
                self.report_error("connection lost".into());
                self.reset(Error::NotReady, ConnectionState::Disconnected);
            }
            TransportEvent::RadioStateChanged(radio) => {
                if radio.is_unavailable() {
                    info!("radio {radio:?}");
                    self.reset(Error::NotReady, ConnectionState::RadioUnavailable);
                } else {
                    debug!("radio {radio:?}");
                }
            }
        }
    }

    fn on_command_notification(&mut self, value: &[u8]) {
        let text = decode_text(value);
        match self.queues.on_response() {
            Some(target) => {
                self.cancel_timer(target.id);
                debug!("{} <- '{text}'", target.id);
                self.finish_response(target.id, target.completion, &text);
            }
            None => {
                let id = self.ledger.record_unmatched(&text);
                warn!("unmatched response '{text}' recorded as {id}");
            }
        }
    }

    fn on_state_bytes(&mut self, bytes: &[u8]) {
        match decode_state(bytes) {
            Some(next) => self.apply_state(next),
            None => warn!("undecodable state payload: {bytes:02x?}"),
        }
    }

    /// Publish a new state.  The high-frequency channel only fires on a real
    /// change; the root channel only fires when the coarse status changes.
    fn apply_state(&mut self, next: DeviceState) {
        if next != self.state {
            self.state = next;
            publish(&self.pubs.state, next);
        }
        let root = next.status.root();
        if root != self.root {
            let old = std::mem::replace(&mut self.root, root);
            debug!("root status {old:?} -> {root:?}");
            publish(&self.pubs.root, root);
            if self
                .tracker
                .on_status_change(old, root, Instant::now(), self.settings.as_mut())
            {
                publish(&self.pubs.homing, self.tracker.progress());
            }
        }
    }

    fn report_error(&mut self, message: String) {
        publish(&self.pubs.error, Some(message));
    }

    // ── Link-up tasks ─────────────────────────────────────────────────────────

    fn read_initial_state(&mut self) {
        let Some(link) = &self.link else { return };
        if !link.transport.has_endpoint(Endpoint::State) {
            return;
        }
        let transport = Arc::clone(&link.transport);
        let cancel = link.cancel.clone();
        let generation = link.generation;
        let io_timeout = self.config.io_timeout;
        let tx = self.loopback.clone();
        tokio::spawn(async move {
            match read_endpoint(transport.as_ref(), Endpoint::State, io_timeout, &cancel).await {
                Ok(Some(bytes)) => {
                    let _ = tx.send(Internal::StateRead {
                        link: generation,
                        bytes,
                    });
                }
                Ok(None) => {}
                Err(e) => debug!("initial state read: {e}"),
            }
        });
    }

    fn sync_speed_knob(&mut self) {
        let Some(link) = &self.link else { return };
        if !link.transport.has_endpoint(Endpoint::SpeedKnobConfig) {
            return;
        }
        let preference = self.settings.get_bool(SPEED_KNOB_AS_LIMIT);
        let transport = Arc::clone(&link.transport);
        let cancel = link.cancel.clone();
        let generation = link.generation;
        let io_timeout = self.config.io_timeout;
        let tx = self.loopback.clone();
        tokio::spawn(async move {
            let value = match preference {
                Some(as_limit) => write_endpoint(
                    transport.as_ref(),
                    Endpoint::SpeedKnobConfig,
                    encode_knob_config(as_limit),
                    io_timeout,
                    &cancel,
                )
                .await
                .map(|done| done.map(|()| as_limit)),
                None => read_endpoint(
                    transport.as_ref(),
                    Endpoint::SpeedKnobConfig,
                    io_timeout,
                    &cancel,
                )
                .await
                .map(|bytes| bytes.and_then(|b| parse_knob_config(&decode_text(&b)))),
            };
            if cancel.is_cancelled() {
                return;
            }
            let _ = tx.send(Internal::KnobConfig {
                link: generation,
                value,
            });
        });
    }

    fn set_speed_knob_limit(&mut self, as_limit: bool, reply: oneshot::Sender<Result<()>>) {
        self.settings.set(SPEED_KNOB_AS_LIMIT, json!(as_limit));

        let link = match &self.link {
            Some(link)
                if !self.simulation && link.transport.has_endpoint(Endpoint::SpeedKnobConfig) =>
            {
                link
            }
            _ => {
                publish(&self.pubs.knob, Some(as_limit));
                let _ = reply.send(Ok(()));
                return;
            }
        };

        let transport = Arc::clone(&link.transport);
        let cancel = link.cancel.clone();
        let generation = link.generation;
        let io_timeout = self.config.io_timeout;
        let tx = self.loopback.clone();
        tokio::spawn(async move {
            let result = write_endpoint(
                transport.as_ref(),
                Endpoint::SpeedKnobConfig,
                encode_knob_config(as_limit),
                io_timeout,
                &cancel,
            )
            .await;
            let outcome = match &result {
                Ok(Some(())) => Ok(()),
                Ok(None) => Err(Error::NotReady),
                Err(e) => Err(e.clone()),
            };
            let _ = reply.send(outcome);
            let _ = tx.send(Internal::KnobConfig {
                link: generation,
                value: result.map(|done| done.map(|()| as_limit)),
            });
        });
    }

    // ── Pattern catalog ───────────────────────────────────────────────────────

    fn refresh_patterns(&mut self) {
        self.cancel_fetch();
        self.fetch_generation += 1;
        let generation = self.fetch_generation;

        let transport = match &self.link {
            Some(link) if !self.simulation => Arc::clone(&link.transport),
            _ => {
                debug!("catalog: no device, using fallback");
                publish(&self.pubs.patterns, fallback_catalog());
                return;
            }
        };

        let cancel = Cancellation::new();
        let task_cancel = cancel.clone();
        let io_timeout = self.config.io_timeout;
        let tx = self.loopback.clone();
        tokio::spawn(async move {
            let catalog = fetch_catalog(transport.as_ref(), io_timeout, &task_cancel).await;
            let _ = tx.send(Internal::CatalogFetched {
                generation,
                catalog,
            });
        });
        self.fetch = Some(FetchTask { generation, cancel });
    }

    fn cancel_fetch(&mut self) {
        if let Some(fetch) = self.fetch.take() {
            debug!("cancelling catalog fetch {}", fetch.generation);
            fetch.cancel.cancel();
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Flush every in-flight command, cancel every timer and task, drop the
    /// link and publish defaults.
    ///
    /// Pending writes fail with `err`, owed responses time out, and the
    /// awaited caller is rejected with `err`.  Idempotent.
    fn reset(&mut self, err: Error, connection: ConnectionState) {
        let drained = self.queues.drain();
        if !drained.is_empty() {
            info!("reset: flushing {} in-flight command(s): {err}", drained.len());
        }
        for (id, completion) in drained.writes {
            self.ledger
                .set_transport_result(id, TransportResult::Failure(err.to_string()));
            self.ledger.resolve(id, CommandOutcome::TransportFailed, None);
            completion.resolve(Err(err.clone()));
        }
        for (id, completion) in drained.responses {
            self.ledger.resolve(id, CommandOutcome::TimedOut, None);
            completion.resolve(Err(Error::Timeout));
        }
        if let Some((id, completion)) = drained.awaited {
            self.ledger.resolve(id, CommandOutcome::TransportFailed, None);
            completion.resolve(Err(err));
        }

        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        self.ledger.clear();
        self.cancel_fetch();
        if let Some(link) = self.link.take() {
            debug!("closing link {}", link.generation);
            link.close();
        }

        self.tracker.reset();
        self.state = DeviceState::default();
        self.root = RootStatus::default();
        publish(&self.pubs.state, self.state);
        publish(&self.pubs.root, self.root);
        publish(&self.pubs.homing, None);
        publish(&self.pubs.patterns, Vec::new());
        publish(&self.pubs.knob, None);
        publish(&self.pubs.connection, connection);
    }
}

// ── EngineHandle ──────────────────────────────────────────────────────────────

/// Cloneable handle to a running [`Engine`].
///
/// Command methods validate locally first; a command that fails validation
/// returns [`Error::InvalidParameter`] without reaching the engine's queues
/// or the transport.
#[derive(Clone)]
pub struct EngineHandle {
    requests: mpsc::Sender<Request>,
    awaited_timeout: Duration,
    connection: watch::Receiver<ConnectionState>,
    state: watch::Receiver<DeviceState>,
    root: watch::Receiver<RootStatus>,
    patterns: watch::Receiver<Vec<PatternEntry>>,
    error: watch::Receiver<Option<String>>,
    homing: watch::Receiver<Option<HomingProgress>>,
    knob: watch::Receiver<Option<bool>>,
}

impl EngineHandle {
    async fn request_engine(&self, req: Request) -> Result<()> {
        self.requests.send(req).await.map_err(|_| Error::EngineStopped)
    }

    async fn validate(&self, command: &Command) -> Result<()> {
        if let Err(e) = command.validate() {
            debug!("'{command}' rejected locally: {e}");
            let _ = self.request_engine(Request::ReportError(e.to_string())).await;
            return Err(e);
        }
        Ok(())
    }

    async fn submit(
        &self,
        command: Command,
        completion: Completion,
        admission: Admission,
    ) -> Result<EventId> {
        let (reply, rx) = oneshot::channel();
        self.request_engine(Request::Submit {
            command,
            completion,
            admission,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::EngineStopped)?
    }

    // ── Submission styles ─────────────────────────────────────────────────────

    /// Fire-and-forget.  Returns once the command is queued.
    pub async fn send(&self, command: Command) -> Result<EventId> {
        self.validate(&command).await?;
        self.submit(command, Completion::Detached, Admission::Background)
            .await
    }

    /// Queue `command` and invoke `callback` with its result later.
    ///
    /// The callback runs at most once, on the engine task, so it must not
    /// block.  A local validation failure invokes it immediately, before this
    /// method returns.
    pub async fn send_with<F>(&self, command: Command, callback: F) -> Result<EventId>
    where
        F: FnOnce(Result<String>) + Send + 'static,
    {
        if let Err(e) = self.validate(&command).await {
            callback(Err(e.clone()));
            return Err(e);
        }
        self.submit(
            command,
            Completion::Callback(Box::new(callback)),
            Admission::Background,
        )
        .await
    }

    /// Queue `command` in the background queue and wait for its response.
    pub async fn request(&self, command: Command) -> Result<String> {
        self.validate(&command).await?;
        let (tx, rx) = oneshot::channel();
        self.submit(command, Completion::Waiter(tx), Admission::Background)
            .await?;
        rx.await.map_err(|_| Error::EngineStopped)?
    }

    /// Send `command` through the exclusive awaited slot and wait for its
    /// response, a timeout, or a lifecycle reset, whichever comes first.
    ///
    /// Fails with [`Error::UnexpectedResponse`] if another awaited command is
    /// outstanding or background responses are still owed.
    pub async fn send_awaited(&self, command: Command, timeout: Option<Duration>) -> Result<String> {
        self.validate(&command).await?;
        let (tx, rx) = oneshot::channel();
        let timeout = timeout.unwrap_or(self.awaited_timeout);
        self.submit(command, Completion::Waiter(tx), Admission::Awaited(timeout))
            .await?;
        rx.await.map_err(|_| Error::EngineStopped)?
    }

    // ── Command API ───────────────────────────────────────────────────────────

    pub async fn navigate_to(&self, page: Page) -> Result<()> {
        self.request(Command::Navigate(page)).await.map(drop)
    }

    pub async fn set_parameter(&self, param: Parameter, value: i64) -> Result<()> {
        self.request(Command::Set { param, value }).await.map(drop)
    }

    pub async fn set_speed(&self, value: i64) -> Result<()> {
        self.set_parameter(Parameter::Speed, value).await
    }

    pub async fn set_stroke(&self, value: i64) -> Result<()> {
        self.set_parameter(Parameter::Stroke, value).await
    }

    pub async fn set_depth(&self, value: i64) -> Result<()> {
        self.set_parameter(Parameter::Depth, value).await
    }

    pub async fn set_sensation(&self, value: i64) -> Result<()> {
        self.set_parameter(Parameter::Sensation, value).await
    }

    pub async fn set_pattern(&self, index: i64) -> Result<()> {
        self.set_parameter(Parameter::Pattern, index).await
    }

    /// Stream a target position, reached over `time_ms`.  Fire-and-forget.
    pub async fn stream_position(&self, position: i64, time_ms: i64) -> Result<EventId> {
        self.send(Command::Stream { position, time_ms }).await
    }

    /// Zero the speed, then return to the menu.
    ///
    /// Both commands are queued before either reply is awaited, and neither
    /// is held back by an outstanding awaited command: they queue behind it
    /// and get their replies after its own.  The first failure is returned
    /// once both have been tried.
    pub async fn emergency_stop(&self) -> Result<()> {
        warn!("emergency stop");
        let (stop_tx, stop_rx) = oneshot::channel();
        let (menu_tx, menu_rx) = oneshot::channel();
        // A rejected submission resolves its waiter with the same error, so
        // only the waiters are consulted.
        let _ = self
            .submit(
                Command::Set {
                    param: Parameter::Speed,
                    value: 0,
                },
                Completion::Waiter(stop_tx),
                Admission::Urgent,
            )
            .await;
        let _ = self
            .submit(
                Command::Navigate(Page::Menu),
                Completion::Waiter(menu_tx),
                Admission::Urgent,
            )
            .await;
        let stop = stop_rx.await.map_err(|_| Error::EngineStopped)?;
        let menu = menu_rx.await.map_err(|_| Error::EngineStopped)?;
        stop.and(menu).map(drop)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Hand a connected transport and its event stream to the engine.
    pub async fn attach(
        &self,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Result<()> {
        self.request_engine(Request::Attach { transport, events })
            .await
    }

    /// Intentional disconnect: flush everything and drop the transport.
    pub async fn disconnect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request_engine(Request::Disconnect(tx)).await?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    /// Rebuild the pattern catalog.  Supersedes any fetch in progress.
    pub async fn refresh_patterns(&self) -> Result<()> {
        self.request_engine(Request::RefreshPatterns).await
    }

    pub async fn set_simulation(&self, on: bool) -> Result<()> {
        self.request_engine(Request::SetSimulation(on)).await
    }

    /// Persist the knob-as-limit preference and push it to the device.
    pub async fn set_speed_knob_limit(&self, as_limit: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request_engine(Request::SetSpeedKnobLimit { as_limit, reply })
            .await?;
        rx.await.map_err(|_| Error::EngineStopped)?
    }

    /// Copy of the command ledger, oldest first.
    pub async fn ledger_snapshot(&self) -> Result<Vec<CommandEvent>> {
        let (tx, rx) = oneshot::channel();
        self.request_engine(Request::LedgerSnapshot(tx)).await?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    pub async fn dismiss_error(&self) -> Result<()> {
        self.request_engine(Request::DismissError).await
    }

    // ── Subscriptions ─────────────────────────────────────────────────────────

    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// High-frequency state; fires only on a structural change.
    pub fn device_state(&self) -> watch::Receiver<DeviceState> {
        self.state.clone()
    }

    /// Coarse status; fires only when the root status changes.
    pub fn root_status(&self) -> watch::Receiver<RootStatus> {
        self.root.clone()
    }

    pub fn patterns(&self) -> watch::Receiver<Vec<PatternEntry>> {
        self.patterns.clone()
    }

    /// Most recent error message, last-write-wins.
    pub fn last_error(&self) -> watch::Receiver<Option<String>> {
        self.error.clone()
    }

    pub fn homing(&self) -> watch::Receiver<Option<HomingProgress>> {
        self.homing.clone()
    }

    pub fn speed_knob_limit(&self) -> watch::Receiver<Option<bool>> {
        self.knob.clone()
    }
}
