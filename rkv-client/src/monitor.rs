//! # Monitor Lines
//!
//! Purpose: Recognise the status lines a server streams after `MONITOR` and
//! turn them into structured events.
//!
//! A line looks like `1458910076.446514 [0 127.0.0.1:60866] "set" "k" "v"`.
//! Anything that does not have that shape is an ordinary reply.

use rkv_proto::RespValue;

/// One command observed by the server while monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorLine {
    /// Server time as `seconds.micros`.
    pub timestamp: String,
    /// Database the command ran against.
    pub db: i64,
    /// Client address, `lua` or `unix:/path`.
    pub source: String,
    /// Command name followed by its arguments.
    pub args: Vec<String>,
}

/// Parses a monitor line out of a simple-string reply.
pub(crate) fn parse(value: &RespValue) -> Option<MonitorLine> {
    let RespValue::Simple(data) = value else {
        return None;
    };
    let line = std::str::from_utf8(data).ok()?;

    let (timestamp, rest) = line.split_once(' ')?;
    let (secs, micros) = timestamp.split_once('.')?;
    if !(10..=11).contains(&secs.len()) || !is_digits(secs) || !is_digits(micros) {
        return None;
    }

    let (origin, command) = rest.strip_prefix('[')?.split_once("] ")?;
    let (db, source) = origin.split_once(' ')?;
    if !is_digits(db) || source.is_empty() {
        return None;
    }

    let quoted = command.strip_prefix('"')?.strip_suffix('"')?;
    let args = quoted
        .split("\" \"")
        .map(|arg| arg.replace("\\\"", "\""))
        .collect();

    Some(MonitorLine {
        timestamp: timestamp.to_string(),
        db: db.parse().ok()?,
        source: source.to_string(),
        args,
    })
}

fn is_digits(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit())
}
