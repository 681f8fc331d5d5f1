//! # Connection Manager
//!
//! Purpose: Own the one live connection, its state machine, both command
//! queues, reconnection and resubscription, all inside a single task.
//!
//! ## Design Principles
//! 1. **Single Writer**: Every queue mutation, state change and write happens
//!    on the manager task; callers talk to it through a channel, so reply
//!    correlation needs no locks.
//! 2. **I/O Only at Suspension Points**: The task waits on one `select!` over
//!    requests, connect, read, write and timers; everything between two
//!    wake-ups is synchronous.
//! 3. **Replace, Never Reuse**: A lost connection is dropped wholesale and a
//!    new stream is requested from the connector.
//! 4. **Gated Ready**: Offline commands are released only after AUTH, the
//!    ready-check, SELECT and every resubscription have been answered.
//!
//! ## State Machine
//!
//! ```text
//! Idle -> Connecting -> Connected -> Ready
//!              ^            |          |
//!              |            v          v
//!              +-------- Broken <------+      any -> Closing (terminal)
//! ```

use std::fmt;
use std::future::{pending, Future};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rkv_proto::{encode, Command, Decoded, Decoder, RespValue};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, sleep_until, Instant, Sleep};
use tracing::{debug, error, info, trace, warn};

use crate::batch::{BatchMode, Outbound};
use crate::config::ClientConfig;
use crate::error::{BrokenReason, ClientError, ClientResult, CommandInfo};
use crate::event::{ClientEvent, PubSubMessage, ReconnectInfo};
use crate::monitor;
use crate::queue::{
    Acks, CommandQueues, InternalOp, InternalReply, QueuedCommand, ReplyMode, ReplySender,
};
use crate::ready::{self, ReadyOutcome, ServerInfo, READY_CHECK_RETRY};
use crate::retry::{plan_retry, RetryPlan, RetryPolicy, RetryState};
use crate::router::{route, Routed};
use crate::subscription::SubscriptionSet;
use crate::transport::{BoxedStream, Connector};

/// Read buffer growth per read.
const READ_CHUNK: usize = 16 * 1024;

/// Lifecycle state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected and no attempt made yet.
    Idle,
    /// Transport connect in progress.
    Connecting,
    /// Transport up; handshake (AUTH, ready-check, resubscribe) in progress.
    Connected,
    /// Commands are written directly.
    Ready,
    /// Shut down by the caller; terminal.
    Closing,
    /// Connection lost. Waiting to reconnect, or terminal once the retry
    /// budget is spent.
    Broken,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
            ConnectionState::Broken => "broken",
        };
        f.write_str(name)
    }
}

/// Snapshot published on every state change.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Set once the client can no longer serve commands.
    pub terminal: Option<ClientError>,
    /// Topics the server has acknowledged.
    pub subscriptions: SubscriptionSet,
    /// Latest `INFO` reply from a ready-check.
    pub server_info: Option<ServerInfo>,
}

impl ConnectionStatus {
    pub(crate) fn idle() -> Self {
        ConnectionStatus {
            state: ConnectionState::Idle,
            terminal: None,
            subscriptions: SubscriptionSet::new(),
            server_info: None,
        }
    }
}

/// Messages from client handles to the manager task.
#[derive(Debug)]
pub(crate) enum Request {
    Submit { command: Command, reply: ReplySender },
    Connect,
    BeginBatch,
    EndBatch,
    Quit { reply: ReplySender },
    Disconnect,
}

impl Request {
    /// Fails a request that never reached the manager.
    pub(crate) fn reject(self) {
        let (command, reply) = match self {
            Request::Submit { command, reply } => (command, reply),
            Request::Quit { reply } => (Command::new("QUIT"), reply),
            _ => return,
        };
        let _ = reply.send(Err(ClientError::ConnectionClosed {
            command: Some(CommandInfo::of(&command)),
            origin: None,
        }));
    }
}

/// Channels the manager publishes on.
pub(crate) struct Outlets {
    pub(crate) events: broadcast::Sender<ClientEvent>,
    pub(crate) messages: broadcast::Sender<PubSubMessage>,
    pub(crate) status: watch::Sender<ConnectionStatus>,
    pub(crate) should_buffer: Arc<AtomicBool>,
}

struct Link {
    reader: ReadHalf<BoxedStream>,
    writer: WriteHalf<BoxedStream>,
}

enum ConnectOutcome {
    Connected(BoxedStream),
    Failed(io::Error),
    TimedOut,
}

type PendingConnect = Pin<Box<dyn Future<Output = ConnectOutcome> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Reconnect,
    ReadyCheck,
}

struct Timer {
    sleep: Pin<Box<Sleep>>,
    kind: TimerKind,
}

enum WriteProgress {
    Wrote(usize),
    Flushed,
}

enum Event {
    Request(Option<Request>),
    Connect(ConnectOutcome),
    Read(io::Result<usize>),
    Write(io::Result<WriteProgress>),
    Timer(TimerKind),
    SocketTimeout,
}

/// The connection actor.
pub(crate) struct ConnectionManager {
    address: String,
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    retry_policy: RetryPolicy,
    requests: mpsc::UnboundedReceiver<Request>,
    requests_open: bool,
    outlets: Outlets,
    state: ConnectionState,
    terminal: Option<ClientError>,
    link: Option<Link>,
    connecting: Option<PendingConnect>,
    timer: Option<Timer>,
    queues: CommandQueues,
    subscriptions: SubscriptionSet,
    decoder: Decoder,
    read_buf: BytesMut,
    outbound: Outbound,
    needs_flush: bool,
    batch: BatchMode,
    reply_mode: ReplyMode,
    retry: RetryState,
    times_connected: u32,
    selected_db: Option<i64>,
    monitoring: bool,
    server_info: Option<ServerInfo>,
    pending_resubscribes: usize,
    last_activity: Instant,
}

impl ConnectionManager {
    pub(crate) fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        requests: mpsc::UnboundedReceiver<Request>,
        outlets: Outlets,
    ) -> Self {
        ConnectionManager {
            address: connector.address(),
            retry_policy: config.retry_policy(),
            selected_db: config.db,
            config,
            connector,
            requests,
            requests_open: true,
            outlets,
            state: ConnectionState::Idle,
            terminal: None,
            link: None,
            connecting: None,
            timer: None,
            queues: CommandQueues::new(),
            subscriptions: SubscriptionSet::new(),
            decoder: Decoder::new(),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            outbound: Outbound::default(),
            needs_flush: false,
            batch: BatchMode::default(),
            reply_mode: ReplyMode::default(),
            retry: RetryState::default(),
            times_connected: 0,
            monitoring: false,
            server_info: None,
            pending_resubscribes: 0,
            last_activity: Instant::now(),
        }
    }

    /// Runs until every client handle is gone and the connection is closed.
    pub(crate) async fn run(mut self) {
        if !self.config.lazy_connect {
            self.start_connect();
        }
        loop {
            let event = self.next_event().await;
            self.handle(event);
            if self.terminal.is_some() && !self.requests_open {
                break;
            }
        }
        debug!("connection manager stopped");
    }

    async fn next_event(&mut self) -> Event {
        let deadline = self.socket_deadline();
        let requests_open = self.requests_open;
        let needs_flush = self.needs_flush;
        let (reader, writer) = match self.link.as_mut() {
            Some(link) => (Some(&mut link.reader), Some(&mut link.writer)),
            None => (None, None),
        };

        tokio::select! {
            request = self.requests.recv(), if requests_open => Event::Request(request),
            outcome = wait_connect(&mut self.connecting) => Event::Connect(outcome),
            read = read_into(reader, &mut self.read_buf) => Event::Read(read),
            progress = drive_writer(writer, &self.outbound, needs_flush) => Event::Write(progress),
            kind = wait_timer(&mut self.timer) => Event::Timer(kind),
            () = wait_deadline(deadline) => Event::SocketTimeout,
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Request(Some(request)) => self.on_request(request),
            Event::Request(None) => {
                self.requests_open = false;
                if self.terminal.is_none() {
                    self.shutdown("client dropped");
                }
            }
            Event::Connect(outcome) => {
                self.connecting = None;
                self.on_connect_outcome(outcome);
            }
            Event::Read(Ok(0)) => self.connection_gone("connection closed by server"),
            Event::Read(Ok(_)) => self.on_data(),
            Event::Read(Err(err)) => self.transport_failed(err),
            Event::Write(Ok(WriteProgress::Wrote(0))) => {
                self.connection_gone("transport accepted no bytes")
            }
            Event::Write(Ok(WriteProgress::Wrote(written))) => {
                self.outbound.advance(written);
                self.needs_flush = true;
                self.update_backpressure();
            }
            Event::Write(Ok(WriteProgress::Flushed)) => self.needs_flush = false,
            Event::Write(Err(err)) => self.transport_failed(err),
            Event::Timer(kind) => {
                self.timer = None;
                match kind {
                    TimerKind::Reconnect => self.reconnect(),
                    TimerKind::ReadyCheck => self.send_ready_check(),
                }
            }
            Event::SocketTimeout => {
                warn!(
                    awaiting = self.awaiting_replies(),
                    "no reply within request timeout"
                );
                self.connection_gone("socket timeout");
            }
        }
    }

    fn on_request(&mut self, request: Request) {
        match request {
            Request::Submit { command, reply } => self.submit(QueuedCommand::caller(command, reply)),
            Request::Connect => {
                if self.state == ConnectionState::Idle {
                    self.start_connect();
                }
            }
            Request::BeginBatch => self.batch.begin(),
            Request::EndBatch => self.end_batch(),
            Request::Quit { reply } => self.quit(reply),
            Request::Disconnect => {
                if self.terminal.is_none() {
                    self.shutdown("disconnect requested");
                }
            }
        }
    }

    // ---- command path ----

    fn submit(&mut self, entry: QueuedCommand) {
        if let Some(err) = self.rejection(&entry) {
            entry.resolve(Err(err));
            return;
        }

        match self.state {
            ConnectionState::Ready => self.write(entry, true),
            _ if !self.config.enable_offline_queue => {
                let command = entry.info();
                entry.resolve(Err(ClientError::NotConnected { command }));
                if self.state == ConnectionState::Idle {
                    self.start_connect();
                }
            }
            _ => {
                trace!(command = %entry.command.name(), state = %self.state, "queued offline");
                self.queues.push_offline(entry);
                if self.state == ConnectionState::Idle {
                    self.start_connect();
                }
            }
        }
    }

    /// Error for a command that can no longer be accepted.
    fn rejection(&self, entry: &QueuedCommand) -> Option<ClientError> {
        match &self.terminal {
            Some(ClientError::ConnectionBroken { reason, origin, .. }) => {
                Some(ClientError::ConnectionBroken {
                    reason: reason.clone(),
                    command: Some(entry.info()),
                    origin: origin.clone(),
                })
            }
            Some(ClientError::ConnectionClosed { origin, .. }) => Some(ClientError::ConnectionClosed {
                command: Some(entry.info()),
                origin: origin.clone(),
            }),
            Some(other) => Some(other.clone()),
            None if self.state == ConnectionState::Closing => Some(ClientError::ConnectionClosed {
                command: Some(entry.info()),
                origin: Some("connection is closing".to_string()),
            }),
            None => None,
        }
    }

    /// Encodes `entry`, hands its bytes to the batch or the outbound buffer,
    /// and appends it to the in-flight queue.
    fn write(&mut self, mut entry: QueuedCommand, batchable: bool) {
        let encoded = match encode(
            self.config.wire_name(entry.command.name()),
            entry.command.args(),
        ) {
            Ok(encoded) => encoded,
            Err(err) => {
                let err = ClientError::from_proto(err, &entry.command);
                debug!(error = %err, "command rejected by encoder");
                if let Some(reply) = entry.resolve(Err(err)) {
                    self.on_internal(reply);
                }
                return;
            }
        };

        entry.silent = self.reply_mode.track(&entry.command);
        if !entry.silent {
            entry.acks = Acks::for_command(&entry.command);
        }
        trace!(
            command = %entry.command.name(),
            bytes = encoded.len(),
            segmented = encoded.is_segmented(),
            silent = entry.silent,
            "write"
        );

        match &mut self.batch {
            BatchMode::Batching(batch) if batchable => {
                batch.push(encoded);
                trace!(pending_bytes = batch.len_bytes(), "batched");
            }
            _ => {
                if self.awaiting_replies() == 0 {
                    self.last_activity = Instant::now();
                }
                self.outbound.push_encoded(encoded);
            }
        }
        self.queues.push_in_flight(entry);
        for reply in self.queues.settle_silent() {
            self.on_internal(reply);
        }
        self.update_backpressure();
    }

    fn write_internal(&mut self, command: Command, op: InternalOp) {
        self.write(QueuedCommand::internal(command, op), false);
    }

    fn end_batch(&mut self) {
        if self.batch.held_commands() > 0 && self.awaiting_replies() == 0 {
            self.last_activity = Instant::now();
        }
        let writes = self.batch.end();
        if !writes.is_empty() {
            debug!(writes = writes.len(), "batch flushed");
        }
        for chunk in writes {
            self.outbound.push(chunk);
        }
        self.update_backpressure();
    }

    fn quit(&mut self, reply: ReplySender) {
        let entry = QueuedCommand::caller(Command::new("QUIT"), reply);
        if let Some(err) = self.rejection(&entry) {
            entry.resolve(Err(err));
            return;
        }
        if self.state == ConnectionState::Ready {
            self.end_batch();
            self.write(entry, false);
            self.set_state(ConnectionState::Closing);
            info!("quit sent; waiting for the server to close");
        } else {
            self.shutdown("quit requested");
            entry.resolve(Ok(RespValue::Simple(Bytes::from_static(b"OK"))));
        }
    }

    fn update_backpressure(&mut self) {
        let pending = self.outbound.pending_bytes();
        let buffering = pending > self.config.write_high_water_mark;
        let was = self.outlets.should_buffer.swap(buffering, Ordering::Relaxed);
        if was != buffering {
            debug!(pending_bytes = pending, should_buffer = buffering, "write backpressure changed");
        }
    }

    // ---- connect and handshake ----

    fn start_connect(&mut self) {
        let budget = self.retry.remaining(self.config.connect_timeout);
        debug!(
            address = %self.address,
            attempt = self.retry.attempt,
            budget_ms = budget.as_millis() as u64,
            "connecting"
        );
        self.set_state(ConnectionState::Connecting);
        let attempt = self.connector.connect();
        self.connecting = Some(Box::pin(async move {
            match tokio::time::timeout(budget, attempt).await {
                Ok(Ok(stream)) => ConnectOutcome::Connected(stream),
                Ok(Err(err)) => ConnectOutcome::Failed(err),
                Err(_) => ConnectOutcome::TimedOut,
            }
        }));
    }

    fn on_connect_outcome(&mut self, outcome: ConnectOutcome) {
        match outcome {
            ConnectOutcome::Connected(stream) => self.on_connect(stream),
            ConnectOutcome::Failed(err) => {
                warn!(address = %self.address, error = %err, "connect failed");
                self.transport_failed(err);
            }
            ConnectOutcome::TimedOut => {
                warn!(address = %self.address, "connect timed out");
                self.retry.exhaust(self.config.connect_timeout);
                self.connection_gone("connection timeout");
            }
        }
    }

    fn on_connect(&mut self, stream: BoxedStream) {
        let (reader, writer) = tokio::io::split(stream);
        self.link = Some(Link { reader, writer });
        self.times_connected += 1;
        self.decoder.reset();
        self.read_buf.clear();
        self.reply_mode = ReplyMode::default();
        self.last_activity = Instant::now();
        self.set_state(ConnectionState::Connected);
        info!(
            address = %self.address,
            times_connected = self.times_connected,
            "connected"
        );
        self.emit(ClientEvent::Connect);

        if self.config.disable_resubscribing {
            self.subscriptions = SubscriptionSet::new();
            self.publish_subscriptions();
        }
        if let Some(password) = self.config.password.clone() {
            let mut auth = Command::new("AUTH");
            if let Some(username) = self.config.username.clone() {
                auth = auth.arg(username);
            }
            self.write_internal(auth.arg(password), InternalOp::Auth);
        }
        if self.config.ready_check {
            self.write_internal(Command::new("INFO"), InternalOp::ReadyCheck);
        } else {
            self.on_ready();
        }
    }

    fn send_ready_check(&mut self) {
        if self.state == ConnectionState::Connected && self.link.is_some() {
            self.write_internal(Command::new("INFO"), InternalOp::ReadyCheck);
        }
    }

    /// Server is usable: restore the database, monitor mode and
    /// subscriptions, then go ready.
    fn on_ready(&mut self) {
        if let Some(db) = self.selected_db {
            self.write_internal(Command::new("SELECT").arg(db), InternalOp::Select);
        }
        if self.monitoring {
            self.write_internal(Command::new("MONITOR"), InternalOp::Monitor);
        }
        if !self.config.disable_resubscribing && !self.subscriptions.is_empty() {
            let commands = self.subscriptions.resubscribe_commands();
            debug!(topics = commands.len(), "resubscribing");
            self.pending_resubscribes = commands.len();
            for command in commands {
                self.write_internal(command, InternalOp::Resubscribe);
            }
            return;
        }
        self.declare_ready();
    }

    fn declare_ready(&mut self) {
        self.retry.reset();
        self.set_state(ConnectionState::Ready);
        info!(address = %self.address, offline = self.queues.offline_len(), "ready");
        self.emit(ClientEvent::Ready);
        self.drain_offline();
    }

    /// Writes offline commands in submission order. Cancelled ones are dropped.
    fn drain_offline(&mut self) {
        let mut drained = 0usize;
        while self.state == ConnectionState::Ready {
            let Some(entry) = self.queues.pop_offline() else {
                break;
            };
            if entry.is_cancelled() {
                trace!(command = %entry.command.name(), "dropping cancelled offline command");
                continue;
            }
            self.write(entry, true);
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, "offline queue drained");
        }
    }

    // ---- reply path ----

    fn on_data(&mut self) {
        self.last_activity = Instant::now();
        self.decoder.feed(&self.read_buf);
        self.read_buf.clear();

        while self.link.is_some() {
            match self.decoder.next_reply() {
                Ok(Some(decoded)) => {
                    if let Some(line) = self.monitor_line(&decoded) {
                        self.emit(ClientEvent::Monitor(line));
                        continue;
                    }
                    for routed in route(&mut self.queues, &mut self.subscriptions, decoded) {
                        self.on_routed(routed);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    self.desync(err.to_string());
                    break;
                }
            }
        }
        self.publish_subscriptions();
    }

    fn monitor_line(&self, decoded: &Decoded) -> Option<monitor::MonitorLine> {
        match decoded {
            Decoded::Reply(value) if self.monitoring => monitor::parse(value),
            _ => None,
        }
    }

    fn on_routed(&mut self, routed: Routed) {
        match routed {
            Routed::Internal(reply) => self.on_internal(reply),
            Routed::Message(message) => {
                // No subscriber is not an error.
                let _ = self.outlets.messages.send(message);
            }
            Routed::Selected(db) => self.selected_db = Some(db),
            Routed::Monitoring => {
                debug!("monitor mode on");
                self.monitoring = true;
            }
            Routed::Desync(detail) => self.desync(detail),
        }
    }

    fn on_internal(&mut self, reply: InternalReply) {
        let InternalReply { op, result } = reply;
        match op {
            InternalOp::Auth => match result {
                Err(ClientError::Reply { message, .. }) if is_needless_auth(&message) => {
                    let warning = "server does not require a password, but one was supplied";
                    warn!("{warning}");
                    self.emit(ClientEvent::Warning(warning.to_string()));
                }
                Err(err) => {
                    warn!(error = %err, "authentication failed");
                    self.emit(ClientEvent::Error(err));
                }
                Ok(_) => {}
            },
            InternalOp::Select | InternalOp::Monitor => {
                if let Err(err) = result {
                    warn!(error = %err, ?op, "handshake command failed");
                    self.emit(ClientEvent::Error(err));
                }
            }
            InternalOp::ReadyCheck => match self.check_ready(&result) {
                ReadyOutcome::Ready => {
                    if self.state == ConnectionState::Connected {
                        self.on_ready();
                    }
                }
                ReadyOutcome::RetryAfter(delay) => {
                    debug!(delay_ms = delay.as_millis() as u64, "server not ready yet");
                    self.schedule(TimerKind::ReadyCheck, delay);
                }
                ReadyOutcome::Failed(reason) => {
                    warn!(%reason, "ready check failed");
                    self.emit(ClientEvent::Error(ClientError::ReadyCheck(reason)));
                    self.schedule(TimerKind::ReadyCheck, READY_CHECK_RETRY);
                }
            },
            InternalOp::Resubscribe => {
                if let Err(err) = result {
                    warn!(error = %err, "resubscribe failed");
                    self.emit(ClientEvent::Error(err));
                }
                self.pending_resubscribes = self.pending_resubscribes.saturating_sub(1);
                if self.pending_resubscribes == 0 && self.state == ConnectionState::Connected {
                    self.declare_ready();
                }
            }
        }
    }

    /// Keeps the parsed `INFO` reply and decides whether the server is ready.
    fn check_ready(&mut self, result: &ClientResult<RespValue>) -> ReadyOutcome {
        let Ok(value) = result else {
            return ready::evaluate(result);
        };
        let info = ServerInfo::from_reply(value);
        debug!(version = ?info.version(), loading = info.is_loading(), "server info");
        let outcome = ready::readiness(&info);
        self.server_info = Some(info);
        self.outlets.status.send_modify(|status| {
            status.server_info = self.server_info.clone();
        });
        outcome
    }

    /// The reply stream cannot be trusted anymore: fail what is in flight and
    /// rebuild the connection.
    fn desync(&mut self, detail: String) {
        let fatal = ClientError::ProtocolDesync {
            detail: detail.clone(),
            command: None,
        };
        error!(error = %fatal, "reply stream desynchronized");
        self.emit(ClientEvent::Fatal(fatal));
        self.queues.flush_in_flight(|command| ClientError::ProtocolDesync {
            detail: detail.clone(),
            command: Some(command),
        });
        self.connection_gone(&detail);
    }

    // ---- loss, retry and shutdown ----

    /// Drops the current connection and everything tied to it.
    fn teardown(&mut self) -> bool {
        let had_link = self.link.take().is_some();
        self.connecting = None;
        self.timer = None;
        let dropped = self.outbound.clear() + self.batch.reset();
        if dropped > 0 {
            debug!(dropped_bytes = dropped, "discarded unwritten bytes");
        }
        self.needs_flush = false;
        self.decoder.reset();
        self.read_buf.clear();
        self.reply_mode = ReplyMode::default();
        self.pending_resubscribes = 0;
        self.update_backpressure();
        had_link
    }

    /// Reports an I/O failure of the stream, then treats it as a loss.
    fn transport_failed(&mut self, err: io::Error) {
        let origin = err.to_string();
        self.emit(ClientEvent::Error(ClientError::from(err)));
        self.connection_gone(&origin);
    }

    /// Handles any loss of the transport or a failed connect attempt.
    ///
    /// **Logic**:
    /// 1. Tear the connection down; publish `End` if one was established.
    /// 2. While closing, finish the shutdown instead of reconnecting.
    /// 3. Ask the retry planner. Giving up fails both queues with
    ///    `ConnectionBroken`.
    /// 4. Otherwise requeue or fail in-flight commands and arm the timer.
    fn connection_gone(&mut self, origin: &str) {
        if self.teardown() {
            info!(address = %self.address, origin, "connection ended");
            self.emit(ClientEvent::End);
        }
        if self.terminal.is_some() {
            return;
        }
        if self.state == ConnectionState::Closing {
            self.close_queues(origin);
            return;
        }

        self.retry.last_error = Some(origin.to_string());
        self.set_state(ConnectionState::Broken);

        let plan = plan_retry(
            self.retry_policy.strategy(),
            &self.retry,
            self.config.connect_timeout,
            self.times_connected,
        );
        match plan {
            RetryPlan::Broken(reason) => self.give_up(reason, origin),
            RetryPlan::Retry(delay) => {
                if self.config.retry_unfulfilled_commands {
                    let moved = self.queues.requeue_in_flight();
                    if moved > 0 {
                        debug!(moved, "in-flight commands will be replayed");
                    }
                } else {
                    let origin = Some(origin.to_string());
                    self.queues.flush_in_flight(|command| ClientError::UncertainState {
                        command,
                        origin: origin.clone(),
                    });
                }
                self.retry.delay = delay;
                warn!(
                    origin,
                    attempt = self.retry.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "connection lost; reconnect scheduled"
                );
                self.schedule(TimerKind::Reconnect, delay);
            }
        }
    }

    fn reconnect(&mut self) {
        let info = ReconnectInfo {
            delay: self.retry.delay,
            attempt: self.retry.attempt,
            total_retry_time: self.retry.total_retry_time,
            times_connected: self.times_connected,
            error: self.retry.last_error.clone(),
        };
        info!(attempt = info.attempt, delay_ms = info.delay.as_millis() as u64, "reconnecting");
        self.emit(ClientEvent::Reconnecting(info));
        self.retry.begin_attempt();
        self.start_connect();
    }

    fn give_up(&mut self, reason: BrokenReason, origin: &str) {
        let origin = Some(origin.to_string());
        let failed = self.queues.flush_all(|command| ClientError::ConnectionBroken {
            reason: reason.clone(),
            command: Some(command),
            origin: origin.clone(),
        });
        let err = ClientError::ConnectionBroken {
            reason,
            command: None,
            origin,
        };
        error!(error = %err, failed, "giving up on the connection");
        self.terminal = Some(err.clone());
        self.set_state(ConnectionState::Broken);
        self.emit(ClientEvent::Error(err));
    }

    fn shutdown(&mut self, origin: &str) {
        if self.teardown() {
            self.emit(ClientEvent::End);
        }
        self.close_queues(origin);
    }

    fn close_queues(&mut self, origin: &str) {
        let origin = Some(origin.to_string());
        let failed = self.queues.flush_all(|command| ClientError::ConnectionClosed {
            command: Some(command),
            origin: origin.clone(),
        });
        self.terminal = Some(ClientError::ConnectionClosed {
            command: None,
            origin,
        });
        self.set_state(ConnectionState::Closing);
        info!(address = %self.address, failed, "connection closed");
    }

    // ---- helpers ----

    fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        self.timer = Some(Timer {
            sleep: Box::pin(sleep(delay)),
            kind,
        });
    }

    /// Commands written to the transport and not yet answered. Batched
    /// commands sit at the tail of the in-flight queue until the batch ends.
    fn awaiting_replies(&self) -> usize {
        self.queues
            .in_flight_len()
            .saturating_sub(self.batch.held_commands())
    }

    fn socket_deadline(&self) -> Option<Instant> {
        let timeout = self.config.request_timeout?;
        if self.link.is_none() || self.awaiting_replies() == 0 {
            return None;
        }
        Some(self.last_activity + timeout)
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "state change");
        }
        self.state = state;
        self.outlets.status.send_replace(ConnectionStatus {
            state,
            terminal: self.terminal.clone(),
            subscriptions: self.subscriptions.clone(),
            server_info: self.server_info.clone(),
        });
    }

    fn publish_subscriptions(&self) {
        self.outlets.status.send_if_modified(|status| {
            if status.subscriptions == self.subscriptions {
                return false;
            }
            status.subscriptions = self.subscriptions.clone();
            true
        });
    }

    fn emit(&self, event: ClientEvent) {
        // Events are advisory; nobody listening is fine.
        let _ = self.outlets.events.send(event);
    }
}

/// AUTH was sent to a server that has no password configured.
fn is_needless_auth(message: &str) -> bool {
    message.contains("no password is set") || message.contains("without any password configured")
}

async fn wait_connect(slot: &mut Option<PendingConnect>) -> ConnectOutcome {
    match slot {
        Some(attempt) => attempt.await,
        None => pending().await,
    }
}

async fn read_into(
    reader: Option<&mut ReadHalf<BoxedStream>>,
    buf: &mut BytesMut,
) -> io::Result<usize> {
    match reader {
        Some(reader) => {
            buf.reserve(READ_CHUNK);
            reader.read_buf(buf).await
        }
        None => pending().await,
    }
}

async fn drive_writer(
    writer: Option<&mut WriteHalf<BoxedStream>>,
    outbound: &Outbound,
    needs_flush: bool,
) -> io::Result<WriteProgress> {
    let Some(writer) = writer else {
        return pending().await;
    };
    match outbound.front() {
        Some(chunk) => writer.write(chunk).await.map(WriteProgress::Wrote),
        None if needs_flush => writer.flush().await.map(|()| WriteProgress::Flushed),
        None => pending().await,
    }
}

async fn wait_timer(slot: &mut Option<Timer>) -> TimerKind {
    match slot {
        Some(timer) => {
            timer.sleep.as_mut().await;
            timer.kind
        }
        None => pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
