//! # Client Errors
//!
//! Purpose: One error type for everything a caller can observe, whether it
//! arrives through a command's reply future or the event channel.
//!
//! ## Design Principles
//! 1. **Attributable**: Errors that abort queued commands carry the command
//!    name and arguments that were lost.
//! 2. **Cloneable**: Errors fan out to many commands and to broadcast
//!    subscribers, so I/O errors are shared behind `Arc`.
//! 3. **Per-Command vs. Fatal**: `is_connection_fatal` separates errors that
//!    drained the queues from errors that touched a single command.

use std::fmt;
use std::sync::Arc;

use rkv_proto::{Command, ProtoError};
use thiserror::Error;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Command identity attached to errors for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInfo {
    /// Upper-cased command name.
    pub name: String,
    /// Arguments rendered lossily as text.
    pub args: Vec<String>,
}

impl CommandInfo {
    pub fn of(command: &Command) -> Self {
        CommandInfo {
            name: command.name().to_ascii_uppercase(),
            args: command.args().iter().map(|arg| arg.to_lossy_string()).collect(),
        }
    }
}

impl fmt::Display for CommandInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Why the connection gave up for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokenReason {
    /// The retry strategy returned an abort.
    RetryAborted(Option<String>),
    /// Cumulative retry time reached the connect timeout.
    TimeoutExceeded,
}

impl fmt::Display for BrokenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokenReason::RetryAborted(Some(reason)) => write!(f, "retry aborted: {reason}"),
            BrokenReason::RetryAborted(None) => f.write_str("retry aborted"),
            BrokenReason::TimeoutExceeded => f.write_str("connection timeout exceeded"),
        }
    }
}

/// Errors surfaced by the client.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// An argument could not be serialized; only this command is rejected.
    #[error("{command}: invalid argument: {reason}")]
    InvalidArgumentType { command: CommandInfo, reason: String },
    /// The connection is not ready and offline queueing is disabled.
    #[error("{command}: connection is not ready and the offline queue is disabled")]
    NotConnected { command: CommandInfo },
    /// The connection dropped while the command was in flight. It might have
    /// been processed by the server.
    #[error("{command}: connection lost and command aborted; it might have been processed{}", origin_suffix(.origin))]
    UncertainState {
        command: CommandInfo,
        origin: Option<String>,
    },
    /// The client was shut down.
    #[error("connection closed and command aborted{}{}", command_suffix(.command), origin_suffix(.origin))]
    ConnectionClosed {
        command: Option<CommandInfo>,
        origin: Option<String>,
    },
    /// Reconnection gave up; the client is terminal.
    #[error("connection in broken state: {reason}{}{}", command_suffix(.command), origin_suffix(.origin))]
    ConnectionBroken {
        reason: BrokenReason,
        command: Option<CommandInfo>,
        origin: Option<String>,
    },
    /// Reply stream no longer lines up with the command queue.
    #[error("protocol desync: {detail}{}", command_suffix(.command))]
    ProtocolDesync {
        detail: String,
        command: Option<CommandInfo>,
    },
    /// The server answered with an error reply.
    #[error("{command}: {message}")]
    Reply { message: String, command: CommandInfo },
    /// The ready check failed with something other than "unknown command".
    #[error("ready check failed: {0}")]
    ReadyCheck(String),
    /// Transport-level failure.
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
    /// The connection target could not be parsed or resolved.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

fn command_suffix(command: &Option<CommandInfo>) -> String {
    match command {
        Some(info) => format!(" ({info})"),
        None => String::new(),
    }
}

fn origin_suffix(origin: &Option<String>) -> String {
    match origin {
        Some(origin) => format!(": {origin}"),
        None => String::new(),
    }
}

impl ClientError {
    /// Returns true for errors that drained every queued command.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionClosed { .. }
                | ClientError::ConnectionBroken { .. }
                | ClientError::ProtocolDesync { .. }
        )
    }

    /// Command the error is attributed to, if any.
    pub fn command(&self) -> Option<&CommandInfo> {
        match self {
            ClientError::InvalidArgumentType { command, .. }
            | ClientError::NotConnected { command }
            | ClientError::UncertainState { command, .. }
            | ClientError::Reply { command, .. } => Some(command),
            ClientError::ConnectionClosed { command, .. }
            | ClientError::ConnectionBroken { command, .. }
            | ClientError::ProtocolDesync { command, .. } => command.as_ref(),
            ClientError::ReadyCheck(_) | ClientError::Io(_) | ClientError::InvalidAddress(_) => {
                None
            }
        }
    }

    pub(crate) fn from_proto(err: ProtoError, command: &Command) -> Self {
        match err {
            ProtoError::InvalidArgumentType { reason, index, .. } => {
                ClientError::InvalidArgumentType {
                    command: CommandInfo::of(command),
                    reason: format!("argument {index}: {reason}"),
                }
            }
            other => ClientError::ProtocolDesync {
                detail: other.to_string(),
                command: Some(CommandInfo::of(command)),
            },
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(Arc::new(err))
    }
}
