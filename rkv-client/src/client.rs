//! # Client Handle
//!
//! Purpose: The cheap, cloneable front door. Every call becomes a message to
//! the connection manager task; results come back through per-command
//! futures, events through broadcast channels.
//!
//! ## Design Principles
//! 1. **Never Fails Synchronously**: `send` always returns a `ReplyFuture`;
//!    every error, even one known up front, arrives through it.
//! 2. **Order Preserved**: Requests travel over one FIFO channel, so the
//!    order of `send` calls is the order commands reach the wire.
//! 3. **Last Handle Closes**: Dropping every clone shuts the connection down.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use rkv_proto::{Command, CommandArg, RespValue};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::Instrument;

use crate::config::ClientConfig;
use crate::connection::{
    ConnectionManager, ConnectionState, ConnectionStatus, Outlets, Request,
};
use crate::error::{ClientError, ClientResult};
use crate::event::{ClientEvent, PubSubMessage};
use crate::ready::ServerInfo;
use crate::subscription::SubscriptionSet;
use crate::transport::{connector_from_config, Connector};

/// Resolves with the reply to one command.
#[derive(Debug)]
#[must_use = "a reply future does nothing unless awaited; dropping it cancels an offline command"]
pub struct ReplyFuture {
    rx: oneshot::Receiver<ClientResult<RespValue>>,
}

impl Future for ReplyFuture {
    type Output = ClientResult<RespValue>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(ClientError::ConnectionClosed {
                    command: None,
                    origin: None,
                })
            })
        })
    }
}

struct Shared {
    id: u64,
    address: String,
    requests: mpsc::UnboundedSender<Request>,
    status: watch::Receiver<ConnectionStatus>,
    events: broadcast::Sender<ClientEvent>,
    messages: broadcast::Sender<PubSubMessage>,
    should_buffer: Arc<AtomicBool>,
}

/// Handle to one resilient connection.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Starts a connection manager for `connector`.
    ///
    /// Must be called inside a Tokio runtime. Unless `config.lazy_connect` is
    /// set, connecting starts right away; subscribe to `events()` first, or
    /// use lazy connect, to observe the first `Connect`.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>, id: u64) -> Client {
        let capacity = config.event_capacity.max(1);
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(capacity);
        let (messages, _) = broadcast::channel(capacity);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::idle());
        let should_buffer = Arc::new(AtomicBool::new(false));
        let address = connector.address();

        let manager = ConnectionManager::new(
            config,
            connector,
            requests_rx,
            Outlets {
                events: events.clone(),
                messages: messages.clone(),
                status: status_tx,
                should_buffer: should_buffer.clone(),
            },
        );
        let span = tracing::info_span!("rkv_client", id, address = %address);
        tokio::spawn(manager.run().instrument(span));

        Client {
            shared: Arc::new(Shared {
                id,
                address,
                requests: requests_tx,
                status: status_rx,
                events,
                messages,
                should_buffer,
            }),
        }
    }

    /// Submits a command.
    ///
    /// The command is accepted synchronously and resolved once its reply
    /// arrives. Dropping the future before the command is written cancels it.
    pub fn send(&self, command: Command) -> ReplyFuture {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Submit { command, reply });
        ReplyFuture { rx }
    }

    /// Starts connecting if the client is idle.
    pub fn connect(&self) {
        self.request(Request::Connect);
    }

    /// Waits until the connection is ready, or fails once it is terminal.
    pub async fn wait_ready(&self) -> ClientResult<()> {
        let mut status = self.shared.status.clone();
        let terminal = {
            let current = status
                .wait_for(|s| s.state == ConnectionState::Ready || s.terminal.is_some())
                .await
                .map_err(|_| ClientError::ConnectionClosed {
                    command: None,
                    origin: None,
                })?;
            current.terminal.clone()
        };
        match terminal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Sends `QUIT` and closes once the server hangs up. When the connection
    /// is not ready the client closes immediately and the future resolves
    /// with `OK`.
    pub fn quit(&self) -> ReplyFuture {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Quit { reply });
        ReplyFuture { rx }
    }

    /// Closes immediately; every queued command fails with `ConnectionClosed`.
    pub fn disconnect(&self) {
        self.request(Request::Disconnect);
    }

    pub fn subscribe<I, T>(&self, channels: I) -> ReplyFuture
    where
        I: IntoIterator<Item = T>,
        T: Into<CommandArg>,
    {
        self.send(Command::with_args("SUBSCRIBE", channels))
    }

    pub fn psubscribe<I, T>(&self, patterns: I) -> ReplyFuture
    where
        I: IntoIterator<Item = T>,
        T: Into<CommandArg>,
    {
        self.send(Command::with_args("PSUBSCRIBE", patterns))
    }

    /// Unsubscribes from `channels`, or from every channel when empty.
    pub fn unsubscribe<I, T>(&self, channels: I) -> ReplyFuture
    where
        I: IntoIterator<Item = T>,
        T: Into<CommandArg>,
    {
        self.send(Command::with_args("UNSUBSCRIBE", channels))
    }

    /// Unsubscribes from `patterns`, or from every pattern when empty.
    pub fn punsubscribe<I, T>(&self, patterns: I) -> ReplyFuture
    where
        I: IntoIterator<Item = T>,
        T: Into<CommandArg>,
    {
        self.send(Command::with_args("PUNSUBSCRIBE", patterns))
    }

    /// Enters monitor mode. Observed commands arrive as
    /// `ClientEvent::Monitor`, and the mode is restored after a reconnect.
    pub fn monitor(&self) -> ReplyFuture {
        self.send(Command::new("MONITOR"))
    }

    /// Defers writes until `end_batch`.
    pub fn begin_batch(&self) {
        self.request(Request::BeginBatch);
    }

    /// Flushes everything deferred since `begin_batch`.
    pub fn end_batch(&self) {
        self.request(Request::EndBatch);
    }

    /// Starts a batch that ends when the pipeline is executed or dropped.
    pub fn pipeline(&self) -> Pipeline<'_> {
        self.begin_batch();
        Pipeline {
            client: self,
            replies: Vec::new(),
            ended: false,
        }
    }

    /// Advisory: true while unwritten bytes exceed the high-water mark.
    pub fn should_buffer(&self) -> bool {
        self.shared.should_buffer.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status.borrow().state
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.clone()
    }

    /// Topics currently acknowledged by the server.
    pub fn subscriptions(&self) -> SubscriptionSet {
        self.shared.status.borrow().subscriptions.clone()
    }

    /// The `INFO` reply of the latest ready-check, if one ran.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared.status.borrow().server_info.clone()
    }

    /// Lifecycle events from now on.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Pub/sub deliveries from now on.
    pub fn messages(&self) -> broadcast::Receiver<PubSubMessage> {
        self.shared.messages.subscribe()
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    fn request(&self, request: Request) {
        if let Err(mpsc::error::SendError(request)) = self.shared.requests.send(request) {
            request.reject();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.shared.id)
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .finish()
    }
}

/// Commands written together in one batch.
#[derive(Debug)]
pub struct Pipeline<'a> {
    client: &'a Client,
    replies: Vec<ReplyFuture>,
    ended: bool,
}

impl Pipeline<'_> {
    pub fn add(&mut self, command: Command) -> &mut Self {
        self.replies.push(self.client.send(command));
        self
    }

    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }

    /// Ends the batch and collects every reply in submission order.
    pub async fn execute(mut self) -> Vec<ClientResult<RespValue>> {
        self.finish();
        let replies = std::mem::take(&mut self.replies);
        let mut results = Vec::with_capacity(replies.len());
        for reply in replies {
            results.push(reply.await);
        }
        results
    }

    fn finish(&mut self) {
        if !self.ended {
            self.ended = true;
            self.client.end_batch();
        }
    }
}

impl Drop for Pipeline<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Creates clients with increasing ids.
#[derive(Debug, Default)]
pub struct ClientFactory {
    next_id: AtomicU64,
}

impl ClientFactory {
    pub fn new() -> Self {
        ClientFactory::default()
    }

    /// Builds the connector from `config` and starts a client.
    pub fn create(&self, config: ClientConfig) -> ClientResult<Client> {
        let connector = connector_from_config(&config)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Client::with_connector(config, connector, id))
    }
}
