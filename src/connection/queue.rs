//! Bounded pending-outbound queue.
//!
//! Holds high-priority messages while the link is down. A message whose
//! `(type, dedupe key)` matches a pending one replaces it in place; once the
//! queue is full the oldest entry is dropped.

use super::protocol::{OutboundKind, OutboundMessage};
use std::collections::VecDeque;
use tracing::warn;

/// Result of [`PendingQueue::push`].
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    Appended,
    /// Replaced an equivalent pending message.
    Replaced,
    /// Appended after dropping the oldest pending message.
    Evicted(OutboundMessage),
}

#[derive(Debug, Clone)]
pub struct PendingQueue {
    messages: VecDeque<OutboundMessage>,
    capacity: usize,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, message: OutboundMessage) -> Enqueued {
        if let Some(key) = message.dedupe_key.as_deref()
            && let Some(existing) = self
                .messages
                .iter_mut()
                .find(|m| m.kind == message.kind && m.dedupe_key.as_deref() == Some(key))
        {
            *existing = message;
            return Enqueued::Replaced;
        }

        let evicted = if self.messages.len() >= self.capacity {
            self.messages.pop_front()
        } else {
            None
        };
        self.messages.push_back(message);

        match evicted {
            Some(dropped) => {
                warn!(
                    kind = %dropped.kind,
                    capacity = self.capacity,
                    "pending queue full, dropped oldest message"
                );
                Enqueued::Evicted(dropped)
            }
            None => Enqueued::Appended,
        }
    }

    /// Take every pending message in submission order.
    pub fn drain(&mut self) -> Vec<OutboundMessage> {
        self.messages.drain(..).collect()
    }

    /// Put unsent messages back ahead of anything queued since.
    pub fn requeue_front(&mut self, messages: Vec<OutboundMessage>) {
        for message in messages.into_iter().rev() {
            self.messages.push_front(message);
        }
        while self.messages.len() > self.capacity {
            self.messages.pop_back();
        }
    }

    /// Remove every pending message of `kind`. Returns how many were removed.
    pub fn discard(&mut self, kind: OutboundKind) -> usize {
        let before = self.messages.len();
        self.messages.retain(|m| m.kind != kind);
        before - self.messages.len()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutboundMessage> {
        self.messages.iter()
    }
}
