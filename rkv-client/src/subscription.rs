//! # Subscription Tracker
//!
//! Purpose: Remember which channels and patterns the server has acknowledged
//! so they can be replayed after a reconnect, and recognise pub/sub pushes in
//! the reply stream.
//!
//! ## Design Principles
//! 1. **Server Is the Source**: Entries change only on subscribe/unsubscribe
//!    acknowledgements, never on the request side.
//! 2. **One Key per Topic**: A topic is keyed by kind (channel or pattern) plus
//!    name, so `news` the channel and `news` the pattern are distinct.
//! 3. **Deterministic Replay**: The set is ordered, so resubscription traffic
//!    is reproducible.

use std::collections::BTreeSet;

use bytes::Bytes;
use rkv_proto::{Command, RespValue};

use crate::event::PubSubMessage;

/// Channel or pattern subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubscribeKind {
    Channel,
    Pattern,
}

impl SubscribeKind {
    fn subscribe_command(self) -> &'static str {
        match self {
            SubscribeKind::Channel => "SUBSCRIBE",
            SubscribeKind::Pattern => "PSUBSCRIBE",
        }
    }
}

/// Direction of a subscription command or acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckAction {
    Subscribe,
    Unsubscribe,
}

/// Identity of one tracked topic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionKey {
    pub kind: SubscribeKind,
    pub topic: Bytes,
}

/// Topics the server currently has registered for this connection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriptionSet {
    entries: BTreeSet<SubscriptionKey>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        SubscriptionSet::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, kind: SubscribeKind, topic: &[u8]) -> bool {
        self.entries.contains(&SubscriptionKey {
            kind,
            topic: Bytes::copy_from_slice(topic),
        })
    }

    /// Number of topics of one kind.
    pub fn count(&self, kind: SubscribeKind) -> usize {
        self.entries.iter().filter(|key| key.kind == kind).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubscriptionKey> {
        self.entries.iter()
    }

    /// Applies one acknowledgement.
    pub(crate) fn apply(&mut self, ack: &SubscriptionAck) {
        let topic = match &ack.topic {
            Some(topic) => topic.clone(),
            None => return,
        };
        let key = SubscriptionKey {
            kind: ack.kind,
            topic,
        };
        match ack.action {
            AckAction::Subscribe => {
                self.entries.insert(key);
            }
            AckAction::Unsubscribe => {
                self.entries.remove(&key);
            }
        }
    }

    /// One subscribe command per tracked topic, in set order.
    pub(crate) fn resubscribe_commands(&self) -> Vec<Command> {
        self.entries
            .iter()
            .map(|key| Command::new(key.kind.subscribe_command()).arg(key.topic.clone()))
            .collect()
    }
}

/// A parsed `subscribe`/`unsubscribe` style acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SubscriptionAck {
    pub(crate) action: AckAction,
    pub(crate) kind: SubscribeKind,
    /// `None` when unsubscribing with nothing subscribed.
    pub(crate) topic: Option<Bytes>,
    /// Total subscriptions left on the connection, as reported by the server.
    pub(crate) remaining: i64,
}

/// A reply recognised as pub/sub traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PubSubReply {
    Ack(SubscriptionAck),
    Message(PubSubMessage),
}

/// Classifies `value` as a pub/sub push or acknowledgement.
pub(crate) fn classify(value: &RespValue) -> Option<PubSubReply> {
    let items = value.as_array()?;
    let head = items.first()?.as_bytes()?;

    match (head, items.len()) {
        (b"message", 3) => Some(PubSubReply::Message(PubSubMessage {
            pattern: None,
            channel: bulk(&items[1])?,
            payload: bulk(&items[2])?,
        })),
        (b"pmessage", 4) => Some(PubSubReply::Message(PubSubMessage {
            pattern: Some(bulk(&items[1])?),
            channel: bulk(&items[2])?,
            payload: bulk(&items[3])?,
        })),
        (_, 3) => {
            let (action, kind) = match head {
                b"subscribe" => (AckAction::Subscribe, SubscribeKind::Channel),
                b"psubscribe" => (AckAction::Subscribe, SubscribeKind::Pattern),
                b"unsubscribe" => (AckAction::Unsubscribe, SubscribeKind::Channel),
                b"punsubscribe" => (AckAction::Unsubscribe, SubscribeKind::Pattern),
                _ => return None,
            };
            let topic = match &items[1] {
                RespValue::Bulk(topic) => topic.clone(),
                _ => return None,
            };
            Some(PubSubReply::Ack(SubscriptionAck {
                action,
                kind,
                topic,
                remaining: items[2].as_integer()?,
            }))
        }
        _ => None,
    }
}

/// Classifies a command as a subscription command.
pub(crate) fn command_kind(command: &Command) -> Option<(AckAction, SubscribeKind)> {
    let name = command.name();
    if name.eq_ignore_ascii_case("SUBSCRIBE") {
        Some((AckAction::Subscribe, SubscribeKind::Channel))
    } else if name.eq_ignore_ascii_case("PSUBSCRIBE") {
        Some((AckAction::Subscribe, SubscribeKind::Pattern))
    } else if name.eq_ignore_ascii_case("UNSUBSCRIBE") {
        Some((AckAction::Unsubscribe, SubscribeKind::Channel))
    } else if name.eq_ignore_ascii_case("PUNSUBSCRIBE") {
        Some((AckAction::Unsubscribe, SubscribeKind::Pattern))
    } else {
        None
    }
}

fn bulk(value: &RespValue) -> Option<Bytes> {
    match value {
        RespValue::Bulk(Some(data)) => Some(data.clone()),
        _ => None,
    }
}
