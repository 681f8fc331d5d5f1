//! # Ready Check
//!
//! Purpose: Interpret the `INFO` ready check sent after connecting and decide
//! whether the server can serve commands yet.

use std::collections::HashMap;
use std::time::Duration;

use rkv_proto::RespValue;

use crate::error::{ClientError, ClientResult};

/// Upper bound for one wait while the dataset is loading.
pub const LOADING_POLL_CAP: Duration = Duration::from_millis(1000);

/// Wait while a replica's link to its master is down.
pub const REPLICA_SYNC_RETRY: Duration = Duration::from_millis(50);

/// Wait after a ready check failed for another reason.
pub const READY_CHECK_RETRY: Duration = Duration::from_secs(1);

/// Parsed `INFO` reply.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    fields: HashMap<String, String>,
}

impl ServerInfo {
    /// Parses `key:value` lines, skipping `# Section` headers and blanks.
    pub fn parse(text: &str) -> Self {
        let fields = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        ServerInfo { fields }
    }

    /// Parses the text payload of an `INFO` reply; anything else is empty.
    pub fn from_reply(value: &RespValue) -> Self {
        let text = value
            .as_bytes()
            .map(String::from_utf8_lossy)
            .unwrap_or_default();
        ServerInfo::parse(&text)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// `redis_version` split into numeric parts, e.g. `[7, 2, 4]`.
    pub fn version(&self) -> Option<Vec<u32>> {
        self.get("redis_version")?
            .split('.')
            .map(|part| part.parse().ok())
            .collect()
    }

    pub fn is_loading(&self) -> bool {
        self.get("loading") == Some("1")
    }
}

/// What to do after a ready-check reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReadyOutcome {
    Ready,
    /// Check again after this delay.
    RetryAfter(Duration),
    /// The check failed; report it and check again after `READY_CHECK_RETRY`.
    Failed(String),
}

/// Evaluates the result of the `INFO` ready check.
///
/// **Logic**:
/// - `loading:1` waits `min(loading_eta_seconds * 1000, 1000)` ms.
/// - `master_link_status` other than `up` waits 50 ms.
/// - An unknown-command error (INFO disabled or renamed away) counts as
///   ready, as does an empty reply.
pub(crate) fn evaluate(result: &ClientResult<RespValue>) -> ReadyOutcome {
    let value = match result {
        Ok(value) => value,
        Err(ClientError::Reply { message, .. }) if is_unknown_command(message) => {
            return ReadyOutcome::Ready;
        }
        Err(err) => return ReadyOutcome::Failed(err.to_string()),
    };
    readiness(&ServerInfo::from_reply(value))
}

/// Readiness of a server that answered the ready check with `info`.
pub(crate) fn readiness(info: &ServerInfo) -> ReadyOutcome {
    if info.is_loading() {
        let eta = info
            .get("loading_eta_seconds")
            .and_then(|eta| eta.parse::<u64>().ok())
            .map(|secs| Duration::from_millis(secs.saturating_mul(1000)))
            .unwrap_or(LOADING_POLL_CAP);
        return ReadyOutcome::RetryAfter(eta.min(LOADING_POLL_CAP));
    }
    if let Some(status) = info.get("master_link_status") {
        if status != "up" {
            return ReadyOutcome::RetryAfter(REPLICA_SYNC_RETRY);
        }
    }
    ReadyOutcome::Ready
}

fn is_unknown_command(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.starts_with("err unknown command") || lower.contains("unknown command 'info'")
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::error::CommandInfo;

    fn info(text: &str) -> ClientResult<RespValue> {
        Ok(RespValue::Bulk(Some(Bytes::copy_from_slice(text.as_bytes()))))
    }

    fn reply_error(message: &str) -> ClientResult<RespValue> {
        Err(ClientError::Reply {
            message: message.to_string(),
            command: CommandInfo::of(&rkv_proto::Command::new("INFO")),
        })
    }

    #[test]
    fn parses_sections_and_version() {
        let parsed = ServerInfo::parse("# Server\r\nredis_version:7.2.4\r\n\r\n# Persistence\r\nloading:0\r\n");
        assert_eq!(parsed.get("loading"), Some("0"));
        assert_eq!(parsed.version(), Some(vec![7, 2, 4]));
        assert!(!parsed.is_loading());
    }

    #[test]
    fn loaded_server_is_ready() {
        assert_eq!(evaluate(&info("loading:0\r\nrole:master\r\n")), ReadyOutcome::Ready);
        assert_eq!(evaluate(&info("")), ReadyOutcome::Ready);
    }

    #[test]
    fn loading_waits_for_eta_capped_at_one_second() {
        assert_eq!(
            evaluate(&info("loading:1\r\nloading_eta_seconds:0\r\n")),
            ReadyOutcome::RetryAfter(Duration::ZERO)
        );
        assert_eq!(
            evaluate(&info("loading:1\r\nloading_eta_seconds:40\r\n")),
            ReadyOutcome::RetryAfter(LOADING_POLL_CAP)
        );
        assert_eq!(
            evaluate(&info("loading:1\r\n")),
            ReadyOutcome::RetryAfter(LOADING_POLL_CAP)
        );
    }

    #[test]
    fn replica_link_down_retries_quickly() {
        assert_eq!(
            evaluate(&info("loading:0\r\nrole:slave\r\nmaster_link_status:down\r\n")),
            ReadyOutcome::RetryAfter(REPLICA_SYNC_RETRY)
        );
        assert_eq!(
            evaluate(&info("role:slave\r\nmaster_link_status:up\r\n")),
            ReadyOutcome::Ready
        );
    }

    #[test]
    fn unknown_info_command_counts_as_ready() {
        assert_eq!(
            evaluate(&reply_error("ERR unknown command 'info'")),
            ReadyOutcome::Ready
        );
        assert!(matches!(
            evaluate(&reply_error("NOAUTH Authentication required.")),
            ReadyOutcome::Failed(_)
        ));
    }
}
