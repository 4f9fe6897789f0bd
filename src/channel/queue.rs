//! Outbound messages buffered while the transport is not open.

use std::collections::VecDeque;

use thiserror::Error;

use crate::channel::proto::OutboundMessage;

/// What to discard when a bounded queue is full.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OverflowPolicy {
    /// Evict the oldest buffered message to make room.
    #[default]
    DropOldest,
    /// Keep the buffer as is and discard the incoming message.
    RejectNew,
}

/// A message was discarded because the outbound queue was full.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("outbound queue is full ({capacity} messages)")]
pub struct QueueOverflow {
    pub capacity: usize,
}

/// FIFO buffer of outbound messages. Unbounded unless a capacity is set.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    items: VecDeque<OutboundMessage>,
    capacity: Option<usize>,
    policy: OverflowPolicy,
}

impl OutboundQueue {
    pub fn new(capacity: Option<usize>, policy: OverflowPolicy) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Appends `message`, returning whichever message did not fit.
    pub fn push(&mut self, message: OutboundMessage) -> Option<(OutboundMessage, QueueOverflow)> {
        let Some(capacity) = self.capacity else {
            self.items.push_back(message);
            return None;
        };

        let overflow = QueueOverflow { capacity };
        if self.items.len() < capacity {
            self.items.push_back(message);
            return None;
        }

        match self.policy {
            OverflowPolicy::RejectNew => Some((message, overflow)),
            OverflowPolicy::DropOldest => match self.items.pop_front() {
                Some(evicted) => {
                    self.items.push_back(message);
                    Some((evicted, overflow))
                }
                None => Some((message, overflow)),
            },
        }
    }

    /// Removes every buffered message in insertion order.
    pub fn drain(&mut self) -> Vec<OutboundMessage> {
        self.items.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{OutboundQueue, OverflowPolicy, QueueOverflow};
    use crate::channel::proto::Envelope;

    fn kinds(queue: &mut OutboundQueue) -> Vec<String> {
        queue.drain().into_iter().map(|message| message.kind).collect()
    }

    #[test]
    fn unbounded_queue_preserves_insertion_order() {
        let mut queue = OutboundQueue::default();
        for kind in ["a", "b", "c"] {
            assert!(queue.push(Envelope::new(kind)).is_none());
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(kinds(&mut queue), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn drop_oldest_evicts_front() {
        let mut queue = OutboundQueue::new(Some(2), OverflowPolicy::DropOldest);
        queue.push(Envelope::new("a"));
        queue.push(Envelope::new("b"));

        let (evicted, overflow) = queue.push(Envelope::new("c")).expect("overflow");
        assert_eq!(evicted.kind, "a");
        assert_eq!(overflow, QueueOverflow { capacity: 2 });
        assert_eq!(kinds(&mut queue), vec!["b", "c"]);
    }

    #[test]
    fn reject_new_keeps_buffer() {
        let mut queue = OutboundQueue::new(Some(1), OverflowPolicy::RejectNew);
        queue.push(Envelope::new("a"));

        let (rejected, _) = queue.push(Envelope::new("b")).expect("overflow");
        assert_eq!(rejected.kind, "b");
        assert_eq!(kinds(&mut queue), vec!["a"]);
    }

    #[test]
    fn zero_capacity_discards_everything() {
        let mut queue = OutboundQueue::new(Some(0), OverflowPolicy::DropOldest);
        let (dropped, _) = queue.push(Envelope::new("a")).expect("overflow");
        assert_eq!(dropped.kind, "a");
        assert!(queue.is_empty());
    }
}
