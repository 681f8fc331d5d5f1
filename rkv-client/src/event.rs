//! # Client Events
//!
//! Lifecycle notifications and pub/sub deliveries, fanned out over broadcast
//! channels so any number of observers can attach.

use std::time::Duration;

use bytes::Bytes;

use crate::error::ClientError;
use crate::monitor::MonitorLine;

/// Details published before each reconnect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectInfo {
    /// Delay that was waited before this attempt.
    pub delay: Duration,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Cumulative retry time before this attempt.
    pub total_retry_time: Duration,
    /// Successful transport connects so far.
    pub times_connected: u32,
    /// Error that caused the disconnect.
    pub error: Option<String>,
}

/// Lifecycle events. This channel is also where connection-level errors that
/// belong to no single command are reported.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Transport connected; the ready-check has not run yet.
    Connect,
    /// Ready-check and resubscription done; commands flow directly.
    Ready,
    /// The connection ended. Published once per connection.
    End,
    /// A reconnect attempt is starting.
    Reconnecting(ReconnectInfo),
    /// Non-fatal error, or the terminal `ConnectionBroken`.
    Error(ClientError),
    /// The reply stream desynchronized; the connection is being rebuilt.
    Fatal(ClientError),
    /// Configuration or server state worth a look.
    Warning(String),
    /// A command the server reported while this client is monitoring.
    Monitor(MonitorLine),
}

/// A message delivered to a subscribed channel or pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// Matching pattern for `pmessage` deliveries.
    pub pattern: Option<Bytes>,
    pub channel: Bytes,
    pub payload: Bytes,
}
