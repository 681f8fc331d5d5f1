//! # Commands
//!
//! Purpose: Describe one request as a name plus ordered arguments.
//!
//! ## Design Principles
//! 1. **Closed Variants**: Every argument is text, bytes, or a timestamp; the
//!    encoder matches on them exhaustively.
//! 2. **Cheap Clones**: Byte arguments are `Bytes`, so re-queueing a command
//!    after a reconnect never copies payloads.

use std::fmt;
use std::time::SystemTime;

use bytes::Bytes;

/// One command argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandArg {
    /// UTF-8 text, sent as its byte representation.
    Text(String),
    /// Binary-safe payload.
    Bytes(Bytes),
    /// Point in time, sent as Unix milliseconds.
    Timestamp(SystemTime),
}

impl CommandArg {
    /// Lossy rendering used in error diagnostics.
    pub fn to_lossy_string(&self) -> String {
        match self {
            CommandArg::Text(text) => text.clone(),
            CommandArg::Bytes(data) => String::from_utf8_lossy(data).into_owned(),
            CommandArg::Timestamp(ts) => format!("{ts:?}"),
        }
    }

    /// Text view for textual arguments.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CommandArg::Text(text) => Some(text),
            CommandArg::Bytes(data) => std::str::from_utf8(data).ok(),
            CommandArg::Timestamp(_) => None,
        }
    }
}

impl From<&str> for CommandArg {
    fn from(value: &str) -> Self {
        CommandArg::Text(value.to_string())
    }
}

impl From<String> for CommandArg {
    fn from(value: String) -> Self {
        CommandArg::Text(value)
    }
}

impl From<&String> for CommandArg {
    fn from(value: &String) -> Self {
        CommandArg::Text(value.clone())
    }
}

impl From<Bytes> for CommandArg {
    fn from(value: Bytes) -> Self {
        CommandArg::Bytes(value)
    }
}

impl From<Vec<u8>> for CommandArg {
    fn from(value: Vec<u8>) -> Self {
        CommandArg::Bytes(Bytes::from(value))
    }
}

impl From<&[u8]> for CommandArg {
    fn from(value: &[u8]) -> Self {
        CommandArg::Bytes(Bytes::copy_from_slice(value))
    }
}

impl From<SystemTime> for CommandArg {
    fn from(value: SystemTime) -> Self {
        CommandArg::Timestamp(value)
    }
}

impl From<i64> for CommandArg {
    fn from(value: i64) -> Self {
        CommandArg::Text(value.to_string())
    }
}

impl From<u64> for CommandArg {
    fn from(value: u64) -> Self {
        CommandArg::Text(value.to_string())
    }
}

impl From<usize> for CommandArg {
    fn from(value: usize) -> Self {
        CommandArg::Text(value.to_string())
    }
}

/// A command name with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<CommandArg>,
}

impl Command {
    /// Creates a command without arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Command {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Creates a command from a name and an argument list.
    pub fn with_args<I, A>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<CommandArg>,
    {
        Command {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<CommandArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[CommandArg] {
        &self.args
    }

    /// Returns true when the name matches `other` ignoring ASCII case.
    pub fn is(&self, other: &str) -> bool {
        self.name.eq_ignore_ascii_case(other)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name.to_ascii_uppercase())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_lossy_string())?;
        }
        Ok(())
    }
}
