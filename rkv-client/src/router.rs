//! # Reply Router
//!
//! Purpose: Match each decoded reply to the oldest in-flight command.
//!
//! ## Design Principles
//! 1. **Strict FIFO**: Replies carry no tags; reply *i* answers command *i*.
//! 2. **Pushes Bypass the Queue**: Pub/sub messages are delivered without
//!    consuming an in-flight entry.
//! 3. **Desync Is Fatal**: A reply with nothing pending means the stream can
//!    no longer be trusted; the router reports it and changes nothing else.

use rkv_proto::{Command, Decoded};

use crate::error::ClientError;
use crate::event::PubSubMessage;
use crate::queue::{Acks, CommandQueues, InternalReply};
use crate::subscription::{self, PubSubReply, SubscriptionAck, SubscriptionSet};

/// Side effects of routing one reply that the connection manager acts on.
#[derive(Debug)]
pub(crate) enum Routed {
    /// An internal command completed.
    Internal(InternalReply),
    /// A pub/sub delivery.
    Message(PubSubMessage),
    /// A caller's `SELECT` succeeded.
    Selected(i64),
    /// A caller's `MONITOR` succeeded.
    Monitoring,
    /// The reply stream no longer lines up with the queue.
    Desync(String),
}

/// Routes one decoded reply.
///
/// **Logic**:
/// 1. While any subscription is active or pending, `message`/`pmessage`
///    pushes are forwarded and subscription acknowledgements are counted
///    against the head command; it completes on its last acknowledgement.
/// 2. Anything else pops the head of the in-flight queue and resolves it.
/// 3. Silent commands that reach the head afterwards resolve with nil.
pub(crate) fn route(
    queues: &mut CommandQueues,
    subscriptions: &mut SubscriptionSet,
    decoded: Decoded,
) -> Vec<Routed> {
    let mut routed: Vec<Routed> = queues
        .settle_silent()
        .into_iter()
        .map(Routed::Internal)
        .collect();

    let result = match decoded {
        Decoded::Reply(value) => {
            if !subscriptions.is_empty() || queues.has_subscription_in_flight() {
                match subscription::classify(&value) {
                    Some(PubSubReply::Message(message)) => {
                        routed.push(Routed::Message(message));
                        return routed;
                    }
                    Some(PubSubReply::Ack(ack)) => {
                        if acknowledge(queues, subscriptions, &ack) == Some(false) {
                            return routed;
                        }
                    }
                    None => {}
                }
            }
            Ok(value)
        }
        Decoded::Error(message) => Err(message),
    };

    let Some(entry) = queues.pop_in_flight() else {
        routed.push(Routed::Desync(
            "reply received with no command pending".to_string(),
        ));
        return routed;
    };

    let result = result.map_err(|message| ClientError::Reply {
        message: String::from_utf8_lossy(&message).into_owned(),
        command: entry.info(),
    });
    if result.is_ok() && !entry.is_internal() {
        if entry.command.is("SELECT") {
            if let Some(db) = selected_db(&entry.command) {
                routed.push(Routed::Selected(db));
            }
        } else if entry.command.is("MONITOR") {
            routed.push(Routed::Monitoring);
        }
    }
    routed.extend(entry.resolve(result).map(Routed::Internal));
    routed.extend(queues.settle_silent().into_iter().map(Routed::Internal));
    routed
}

/// Counts one acknowledgement against the head command.
///
/// Returns `None` when the head is not a subscription command, otherwise
/// whether the head has now received all of its acknowledgements.
fn acknowledge(
    queues: &mut CommandQueues,
    subscriptions: &mut SubscriptionSet,
    ack: &SubscriptionAck,
) -> Option<bool> {
    let head = queues.front_in_flight_mut()?;
    let acks = head.acks.as_mut()?;
    subscriptions.apply(ack);
    tracing::trace!(kind = ?ack.kind, remaining = ack.remaining, "subscription acknowledged");
    let complete = match acks {
        Acks::Count(remaining) => {
            *remaining = remaining.saturating_sub(1);
            *remaining == 0
        }
        Acks::UntilEmpty(kind) => subscriptions.count(*kind) == 0,
    };
    Some(complete)
}

fn selected_db(command: &Command) -> Option<i64> {
    command.args().first()?.as_text()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rkv_proto::RespValue;
    use tokio::sync::oneshot;

    use super::*;
    use crate::error::ClientResult;
    use crate::queue::{InternalOp, QueuedCommand};
    use crate::subscription::SubscribeKind;

    type Rx = oneshot::Receiver<ClientResult<RespValue>>;

    fn push(queues: &mut CommandQueues, command: Command) -> Rx {
        let (tx, rx) = oneshot::channel();
        let mut entry = QueuedCommand::caller(command.clone(), tx);
        entry.acks = Acks::for_command(&command);
        queues.push_in_flight(entry);
        rx
    }

    fn bulk(data: &'static str) -> RespValue {
        RespValue::Bulk(Some(Bytes::from_static(data.as_bytes())))
    }

    fn push_frame(items: Vec<RespValue>) -> Decoded {
        Decoded::Reply(RespValue::Array(Some(items)))
    }

    fn ack(kind: &'static str, topic: &'static str, count: i64) -> Decoded {
        push_frame(vec![bulk(kind), bulk(topic), RespValue::Integer(count)])
    }

    fn received(rx: &mut Rx) -> Option<ClientResult<RespValue>> {
        rx.try_recv().ok()
    }

    #[test]
    fn replies_resolve_commands_in_fifo_order() {
        let mut queues = CommandQueues::new();
        let mut subs = SubscriptionSet::new();
        let mut receivers: Vec<Rx> = (0..5)
            .map(|i| push(&mut queues, Command::new("INCR").arg(format!("k{i}"))))
            .collect();

        for i in 0..5 {
            let routed = route(&mut queues, &mut subs, Decoded::Reply(RespValue::Integer(i)));
            assert!(routed.is_empty());
        }
        for (i, rx) in receivers.iter_mut().enumerate() {
            assert_eq!(received(rx).and_then(Result::ok), Some(RespValue::Integer(i as i64)));
        }
        assert_eq!(queues.in_flight_len(), 0);
    }

    #[test]
    fn error_reply_rejects_only_its_command() {
        let mut queues = CommandQueues::new();
        let mut subs = SubscriptionSet::new();
        let mut first = push(&mut queues, Command::new("INCR").arg("text"));
        let mut second = push(&mut queues, Command::new("GET").arg("k"));

        route(
            &mut queues,
            &mut subs,
            Decoded::Error(Bytes::from_static(b"ERR value is not an integer")),
        );
        route(&mut queues, &mut subs, Decoded::Reply(bulk("v")));

        match received(&mut first) {
            Some(Err(ClientError::Reply { message, command })) => {
                assert_eq!(message, "ERR value is not an integer");
                assert_eq!(command.name, "INCR");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(received(&mut second).and_then(Result::ok), Some(bulk("v")));
    }

    #[test]
    fn reply_without_pending_command_is_desync() {
        let mut queues = CommandQueues::new();
        let mut subs = SubscriptionSet::new();
        let routed = route(&mut queues, &mut subs, Decoded::Reply(RespValue::Integer(1)));
        assert!(matches!(routed.as_slice(), [Routed::Desync(_)]));
    }

    #[test]
    fn subscribe_completes_after_every_ack_and_messages_pass_through() {
        let mut queues = CommandQueues::new();
        let mut subs = SubscriptionSet::new();
        let mut sub = push(&mut queues, Command::with_args("SUBSCRIBE", ["news", "sports"]));
        let mut get = push(&mut queues, Command::new("PING"));

        assert!(route(&mut queues, &mut subs, ack("subscribe", "news", 1)).is_empty());
        assert!(received(&mut sub).is_none());

        let routed = route(
            &mut queues,
            &mut subs,
            push_frame(vec![bulk("message"), bulk("news"), bulk("hello")]),
        );
        match routed.as_slice() {
            [Routed::Message(message)] => assert_eq!(message.payload, Bytes::from_static(b"hello")),
            other => panic!("unexpected {other:?}"),
        }

        route(&mut queues, &mut subs, ack("subscribe", "sports", 2));
        assert!(matches!(received(&mut sub), Some(Ok(RespValue::Array(_)))));
        assert_eq!(subs.len(), 2);

        route(&mut queues, &mut subs, Decoded::Reply(RespValue::Simple(Bytes::from_static(b"PONG"))));
        assert!(matches!(received(&mut get), Some(Ok(RespValue::Simple(_)))));
    }

    #[test]
    fn unsubscribe_all_waits_until_kind_is_empty() {
        let mut queues = CommandQueues::new();
        let mut subs = SubscriptionSet::new();
        let _sub = push(&mut queues, Command::with_args("SUBSCRIBE", ["a", "b"]));
        route(&mut queues, &mut subs, ack("subscribe", "a", 1));
        route(&mut queues, &mut subs, ack("subscribe", "b", 2));

        let mut unsub = push(&mut queues, Command::new("UNSUBSCRIBE"));
        route(&mut queues, &mut subs, ack("unsubscribe", "a", 1));
        assert!(received(&mut unsub).is_none());
        route(&mut queues, &mut subs, ack("unsubscribe", "b", 0));
        assert!(received(&mut unsub).is_some());
        assert!(subs.is_empty());
        assert!(!subs.contains(SubscribeKind::Channel, b"a"));
    }

    #[test]
    fn message_shaped_reply_without_subscriptions_is_a_plain_reply() {
        let mut queues = CommandQueues::new();
        let mut subs = SubscriptionSet::new();
        let mut lrange = push(&mut queues, Command::with_args("LRANGE", ["l", "0", "-1"]));
        let frame = vec![bulk("message"), bulk("a"), bulk("b")];
        route(&mut queues, &mut subs, push_frame(frame.clone()));
        assert_eq!(
            received(&mut lrange).and_then(Result::ok),
            Some(RespValue::Array(Some(frame)))
        );
    }

    #[test]
    fn silent_commands_resolve_behind_answered_ones() {
        let mut queues = CommandQueues::new();
        let mut subs = SubscriptionSet::new();
        let mut get = push(&mut queues, Command::new("GET").arg("k"));
        let (tx, mut silent) = oneshot::channel();
        let mut entry = QueuedCommand::caller(Command::new("SET").arg("k").arg("v"), tx);
        entry.silent = true;
        queues.push_in_flight(entry);

        route(&mut queues, &mut subs, Decoded::Reply(RespValue::nil()));
        assert!(received(&mut get).is_some());
        assert_eq!(received(&mut silent).and_then(Result::ok), Some(RespValue::nil()));
        assert_eq!(queues.in_flight_len(), 0);
    }

    #[test]
    fn select_and_internal_replies_are_reported() {
        let mut queues = CommandQueues::new();
        let mut subs = SubscriptionSet::new();
        let _select = push(&mut queues, Command::new("SELECT").arg(4i64));
        queues.push_in_flight(QueuedCommand::internal(Command::new("INFO"), InternalOp::ReadyCheck));

        let routed = route(&mut queues, &mut subs, Decoded::Reply(RespValue::Simple(Bytes::from_static(b"OK"))));
        assert!(matches!(routed.as_slice(), [Routed::Selected(4)]));

        let routed = route(&mut queues, &mut subs, Decoded::Reply(bulk("loading:0")));
        match routed.as_slice() {
            [Routed::Internal(reply)] => {
                assert_eq!(reply.op, InternalOp::ReadyCheck);
                assert!(reply.result.is_ok());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn successful_monitor_is_reported_once() {
        let mut queues = CommandQueues::new();
        let mut subs = SubscriptionSet::new();
        let _monitor = push(&mut queues, Command::new("monitor"));
        queues.push_in_flight(QueuedCommand::internal(Command::new("MONITOR"), InternalOp::Monitor));

        let ok = || Decoded::Reply(RespValue::Simple(Bytes::from_static(b"OK")));
        assert!(matches!(route(&mut queues, &mut subs, ok()).as_slice(), [Routed::Monitoring]));
        match route(&mut queues, &mut subs, ok()).as_slice() {
            [Routed::Internal(reply)] => assert_eq!(reply.op, InternalOp::Monitor),
            other => panic!("unexpected {other:?}"),
        }
    }
}
