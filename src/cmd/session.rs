use std::collections::BTreeSet;

use bytes::Bytes;

use crate::frame::Frame;
use crate::pubsub::MessageSender;
use crate::state::ServerState;

use super::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    /// Between MULTI and EXEC/DISCARD.
    Queuing,
    /// After the first (P)SUBSCRIBE, until RESET.
    Subscribed,
}

/// Where a connection's commands come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Client,
    /// The replica's link to its master. `offset` is how many bytes of the
    /// master's stream were applied before the current command.
    Master { offset: u64 },
}

/// Protocol state owned by one connection task.
#[derive(Debug)]
pub struct Session {
    mode: Mode,
    queued: Vec<(Command, Frame)>,
    subscriber_id: u64,
    messages: MessageSender,
    channels: BTreeSet<Bytes>,
    patterns: BTreeSet<Bytes>,
    origin: Origin,
}

impl Session {
    /// `messages` receives pub/sub deliveries for this connection.
    pub fn new(subscriber_id: u64, messages: MessageSender) -> Session {
        Session {
            mode: Mode::Normal,
            queued: vec![],
            subscriber_id,
            messages,
            channels: BTreeSet::new(),
            patterns: BTreeSet::new(),
            origin: Origin::Client,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn set_origin(&mut self, origin: Origin) {
        self.origin = origin;
    }

    /// Writes are forwarded only when a client sent them to a master.
    pub fn forwards_writes(&self, state: &ServerState) -> bool {
        self.origin == Origin::Client && state.replication.is_master()
    }

    pub(super) fn begin(&mut self) {
        self.mode = Mode::Queuing;
        self.queued.clear();
    }

    pub(super) fn queue(&mut self, command: Command, frame: Frame) {
        self.queued.push((command, frame));
    }

    /// Ends the transaction, handing back what was queued. `None` outside a
    /// transaction.
    pub(super) fn take_queued(&mut self) -> Option<Vec<(Command, Frame)>> {
        if self.mode != Mode::Queuing {
            return None;
        }

        self.mode = Mode::Normal;
        Some(std::mem::take(&mut self.queued))
    }

    /// Drops the transaction. Returns false when there was none.
    pub(super) fn discard(&mut self) -> bool {
        self.take_queued().is_some()
    }

    pub(super) fn subscriber_id(&self) -> u64 {
        self.subscriber_id
    }

    pub(super) fn messages(&self) -> MessageSender {
        self.messages.clone()
    }

    pub(super) fn enter_subscribed(&mut self) {
        self.mode = Mode::Subscribed;
    }

    pub(super) fn channels(&mut self) -> &mut BTreeSet<Bytes> {
        &mut self.channels
    }

    pub(super) fn patterns(&mut self) -> &mut BTreeSet<Bytes> {
        &mut self.patterns
    }

    /// Channels plus patterns, as reported in (un)subscribe replies.
    pub(super) fn subscription_count(&self) -> usize {
        self.channels.len() + self.patterns.len()
    }

    /// Leaves any transaction and subscribe mode.
    pub fn reset(&mut self, state: &ServerState) {
        self.unsubscribe_all(state);
        self.queued.clear();
        self.mode = Mode::Normal;
    }

    /// Releases everything this connection registered with shared state.
    pub fn close(&mut self, state: &ServerState) {
        self.unsubscribe_all(state);
    }

    fn unsubscribe_all(&mut self, state: &ServerState) {
        for channel in std::mem::take(&mut self.channels) {
            state.pubsub.unsubscribe(self.subscriber_id, &channel);
        }
        for pattern in std::mem::take(&mut self.patterns) {
            state.pubsub.punsubscribe(self.subscriber_id, &pattern);
        }
    }
}
