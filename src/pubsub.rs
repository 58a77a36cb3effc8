//! Channel and pattern subscriptions.
//!
//! Each subscribed connection owns the receiving half of an unbounded channel;
//! PUBLISH pushes ready-made message frames into every matching sender.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::frame::Frame;
use crate::glob;

pub type MessageSender = UnboundedSender<Frame>;

#[derive(Debug, Clone, Default)]
pub struct PubSub {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

#[derive(Debug, Default)]
struct Registry {
    channels: HashMap<Bytes, HashMap<u64, MessageSender>>,
    patterns: HashMap<Bytes, HashMap<u64, MessageSender>>,
}

impl PubSub {
    pub fn new() -> PubSub {
        PubSub::default()
    }

    /// Identity for a new subscriber connection.
    pub fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn subscribe(&self, id: u64, channel: Bytes, tx: MessageSender) {
        self.registry().channels.entry(channel).or_default().insert(id, tx);
    }

    pub fn unsubscribe(&self, id: u64, channel: &Bytes) {
        remove(&mut self.registry().channels, id, channel);
    }

    pub fn psubscribe(&self, id: u64, pattern: Bytes, tx: MessageSender) {
        self.registry().patterns.entry(pattern).or_default().insert(id, tx);
    }

    pub fn punsubscribe(&self, id: u64, pattern: &Bytes) {
        remove(&mut self.registry().patterns, id, pattern);
    }

    /// Delivers `message` to every subscriber of `channel` and of every
    /// matching pattern. Returns the number of deliveries. Subscribers whose
    /// connection has gone away are dropped.
    pub fn publish(&self, channel: &Bytes, message: &Bytes) -> usize {
        let mut registry = self.registry();
        let mut delivered = 0;

        if let Some(subscribers) = registry.channels.get_mut(channel) {
            let frame = Frame::command([Bytes::from_static(b"message"), channel.clone(), message.clone()]);
            delivered += deliver(subscribers, &frame);
        }

        for (pattern, subscribers) in registry.patterns.iter_mut() {
            if glob::matches(pattern, channel) {
                let frame = Frame::command([
                    Bytes::from_static(b"pmessage"),
                    pattern.clone(),
                    channel.clone(),
                    message.clone(),
                ]);
                delivered += deliver(subscribers, &frame);
            }
        }

        registry.channels.retain(|_, subscribers| !subscribers.is_empty());
        registry.patterns.retain(|_, subscribers| !subscribers.is_empty());

        debug!(channel = ?channel, delivered, "published");

        delivered
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.shared.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn deliver(subscribers: &mut HashMap<u64, MessageSender>, frame: &Frame) -> usize {
    subscribers.retain(|_, tx| tx.send(frame.clone()).is_ok());
    subscribers.len()
}

fn remove(table: &mut HashMap<Bytes, HashMap<u64, MessageSender>>, id: u64, name: &Bytes) {
    if let Some(subscribers) = table.get_mut(name) {
        subscribers.remove(&id);
        if subscribers.is_empty() {
            table.remove(name);
        }
    }
}
