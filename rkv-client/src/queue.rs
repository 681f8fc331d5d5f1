//! # Command Queue Pair
//!
//! Purpose: Hold every accepted command in exactly one of two FIFO queues:
//! `offline` (accepted before the connection was ready) or `in_flight`
//! (written to the wire, awaiting its reply).
//!
//! ## Design Principles
//! 1. **Single Owner**: A `QueuedCommand` is moved between queues, never
//!    cloned, so it cannot be answered twice.
//! 2. **Wire Order**: `in_flight` order is write order is reply order.
//! 3. **Attributable Flushes**: Bulk failures build each error from the
//!    command's own name and arguments.
//! 4. **Silent Entries**: Commands written while replies are switched off stay
//!    in wire order and resolve with nil once they reach the head.

use std::collections::VecDeque;
use std::time::Instant;

use rkv_proto::{Command, RespValue};
use tokio::sync::oneshot;

use crate::error::{ClientError, ClientResult, CommandInfo};
use crate::subscription::{self, AckAction, SubscribeKind};

/// Caller side of a command's result channel.
pub(crate) type ReplySender = oneshot::Sender<ClientResult<RespValue>>;

/// Commands the connection manager issues on its own behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InternalOp {
    Auth,
    ReadyCheck,
    Select,
    Monitor,
    Resubscribe,
}

/// Where a command's result goes.
#[derive(Debug)]
pub(crate) enum ReplyTarget {
    Caller(ReplySender),
    Internal(InternalOp),
}

/// Acknowledgements a subscription command still waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acks {
    /// One acknowledgement per topic argument.
    Count(usize),
    /// Unsubscribe-all: done once no topic of this kind is left.
    UntilEmpty(SubscribeKind),
}

impl Acks {
    /// Expected acknowledgements for a subscription command.
    pub(crate) fn for_command(command: &Command) -> Option<Acks> {
        let (action, kind) = subscription::command_kind(command)?;
        let topics = command.args().len();
        Some(match action {
            AckAction::Unsubscribe if topics == 0 => Acks::UntilEmpty(kind),
            _ => Acks::Count(topics.max(1)),
        })
    }
}

/// A command owned by one of the queues.
#[derive(Debug)]
pub(crate) struct QueuedCommand {
    pub(crate) command: Command,
    pub(crate) target: ReplyTarget,
    pub(crate) created_at: Instant,
    /// The server will not answer this command.
    pub(crate) silent: bool,
    pub(crate) acks: Option<Acks>,
}

/// Result of an internal command, handed back to the connection manager.
#[derive(Debug)]
pub(crate) struct InternalReply {
    pub(crate) op: InternalOp,
    pub(crate) result: ClientResult<RespValue>,
}

impl QueuedCommand {
    pub(crate) fn caller(command: Command, reply: ReplySender) -> Self {
        QueuedCommand::with_target(command, ReplyTarget::Caller(reply))
    }

    pub(crate) fn internal(command: Command, op: InternalOp) -> Self {
        QueuedCommand::with_target(command, ReplyTarget::Internal(op))
    }

    fn with_target(command: Command, target: ReplyTarget) -> Self {
        QueuedCommand {
            command,
            target,
            created_at: Instant::now(),
            silent: false,
            acks: None,
        }
    }

    pub(crate) fn info(&self) -> CommandInfo {
        CommandInfo::of(&self.command)
    }

    pub(crate) fn is_internal(&self) -> bool {
        matches!(self.target, ReplyTarget::Internal(_))
    }

    /// True once the caller stopped waiting for the result.
    pub(crate) fn is_cancelled(&self) -> bool {
        match &self.target {
            ReplyTarget::Caller(reply) => reply.is_closed(),
            ReplyTarget::Internal(_) => false,
        }
    }

    /// Delivers the result. Internal results are returned to the caller of
    /// this method instead.
    pub(crate) fn resolve(self, result: ClientResult<RespValue>) -> Option<InternalReply> {
        match self.target {
            ReplyTarget::Caller(reply) => {
                // The caller may have dropped its future; the reply is still consumed.
                let _ = reply.send(result);
                None
            }
            ReplyTarget::Internal(op) => Some(InternalReply { op, result }),
        }
    }
}

/// The offline and in-flight queues.
#[derive(Debug, Default)]
pub(crate) struct CommandQueues {
    in_flight: VecDeque<QueuedCommand>,
    offline: VecDeque<QueuedCommand>,
    subscription_commands: usize,
}

impl CommandQueues {
    pub(crate) fn new() -> Self {
        CommandQueues::default()
    }

    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub(crate) fn offline_len(&self) -> usize {
        self.offline.len()
    }

    /// True while a subscription command is awaiting acknowledgements.
    pub(crate) fn has_subscription_in_flight(&self) -> bool {
        self.subscription_commands > 0
    }

    pub(crate) fn push_offline(&mut self, entry: QueuedCommand) {
        self.offline.push_back(entry);
    }

    pub(crate) fn pop_offline(&mut self) -> Option<QueuedCommand> {
        self.offline.pop_front()
    }

    pub(crate) fn push_in_flight(&mut self, entry: QueuedCommand) {
        if entry.acks.is_some() {
            self.subscription_commands += 1;
        }
        self.in_flight.push_back(entry);
    }

    pub(crate) fn front_in_flight_mut(&mut self) -> Option<&mut QueuedCommand> {
        self.in_flight.front_mut()
    }

    pub(crate) fn pop_in_flight(&mut self) -> Option<QueuedCommand> {
        let entry = self.in_flight.pop_front()?;
        if entry.acks.is_some() {
            self.subscription_commands -= 1;
        }
        Some(entry)
    }

    /// Resolves silent commands that reached the head with nil.
    pub(crate) fn settle_silent(&mut self) -> Vec<InternalReply> {
        let mut internal = Vec::new();
        while self.in_flight.front().is_some_and(|entry| entry.silent) {
            if let Some(entry) = self.pop_in_flight() {
                internal.extend(entry.resolve(Ok(RespValue::nil())));
            }
        }
        internal
    }

    /// Moves every in-flight caller command back to the front of the offline
    /// queue, keeping order. Internal commands are dropped; they are
    /// re-issued by the next handshake.
    pub(crate) fn requeue_in_flight(&mut self) -> usize {
        let mut moved = 0;
        while let Some(mut entry) = self.in_flight.pop_back() {
            if entry.is_internal() {
                continue;
            }
            entry.silent = false;
            entry.acks = None;
            self.offline.push_front(entry);
            moved += 1;
        }
        self.subscription_commands = 0;
        moved
    }

    /// Fails every in-flight command with the error built by `make_err`.
    pub(crate) fn flush_in_flight<F>(&mut self, make_err: F) -> usize
    where
        F: Fn(CommandInfo) -> ClientError,
    {
        let drained: Vec<QueuedCommand> = self.in_flight.drain(..).collect();
        self.subscription_commands = 0;
        fail_all(drained, &make_err)
    }

    /// Fails every queued command, in-flight first, then offline.
    pub(crate) fn flush_all<F>(&mut self, make_err: F) -> usize
    where
        F: Fn(CommandInfo) -> ClientError,
    {
        let mut failed = self.flush_in_flight(&make_err);
        let drained: Vec<QueuedCommand> = self.offline.drain(..).collect();
        failed += fail_all(drained, &make_err);
        failed
    }
}

fn fail_all<F>(entries: Vec<QueuedCommand>, make_err: &F) -> usize
where
    F: Fn(CommandInfo) -> ClientError,
{
    let mut failed = 0;
    for entry in entries {
        if entry.is_internal() {
            continue;
        }
        let err = make_err(entry.info());
        tracing::trace!(
            command = %entry.command.name(),
            age_ms = entry.created_at.elapsed().as_millis() as u64,
            "command aborted"
        );
        entry.resolve(Err(err));
        failed += 1;
    }
    failed
}

/// Client-side view of `CLIENT REPLY ON|OFF|SKIP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ReplyMode {
    #[default]
    On,
    Off,
    /// The next command's reply is suppressed.
    SkipNext,
}

impl ReplyMode {
    /// Updates the mode for a command about to be written and returns whether
    /// the server will stay silent for it.
    pub(crate) fn track(&mut self, command: &Command) -> bool {
        if let Some(requested) = reply_switch(command) {
            return match (requested, *self) {
                (Requested::On, _) => {
                    *self = ReplyMode::On;
                    false
                }
                (Requested::Off, _) => {
                    *self = ReplyMode::Off;
                    true
                }
                // SKIP has no effect while replies are off.
                (Requested::Skip, ReplyMode::Off) => true,
                (Requested::Skip, _) => {
                    *self = ReplyMode::SkipNext;
                    true
                }
            };
        }
        match *self {
            ReplyMode::On => false,
            ReplyMode::Off => true,
            ReplyMode::SkipNext => {
                *self = ReplyMode::On;
                true
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Requested {
    On,
    Off,
    Skip,
}

fn reply_switch(command: &Command) -> Option<Requested> {
    if !command.is("CLIENT") {
        return None;
    }
    let args = command.args();
    if args.len() != 2 || !args[0].as_text()?.eq_ignore_ascii_case("REPLY") {
        return None;
    }
    let mode = args[1].as_text()?;
    if mode.eq_ignore_ascii_case("ON") {
        Some(Requested::On)
    } else if mode.eq_ignore_ascii_case("OFF") {
        Some(Requested::Off)
    } else if mode.eq_ignore_ascii_case("SKIP") {
        Some(Requested::Skip)
    } else {
        None
    }
}
