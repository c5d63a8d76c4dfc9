//! Outgoing messages for one node, split by reliability class.
//!
//! Both classes are ordered by [`MessageId`]. Unreliable entries leave the
//! queue as soon as they are packed; reliable entries stay until a packet
//! carrying them is acknowledged.

use std::collections::BTreeMap;

use crate::protocol::message::Message;

/// Per-node message number, starting at 1
pub type MessageId = u32;

/// A message waiting to be sent or acknowledged
#[derive(Debug)]
pub struct QueuedMessage {
    pub message: Box<dyn Message>,
    /// Body size, excluding the type tag
    pub bits_required: usize,
    /// Time of the last send, `None` while unsent
    pub time_last_sent: Option<f32>,
    /// Travelling as a fragmented transfer
    pub fragmented: bool,
}

#[derive(Debug)]
pub struct MessageQueue {
    next_id: MessageId,
    reliable: BTreeMap<MessageId, QueuedMessage>,
    unreliable: BTreeMap<MessageId, QueuedMessage>,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            reliable: BTreeMap::new(),
            unreliable: BTreeMap::new(),
        }
    }

    /// Queue `message`, returning the id it was given
    pub fn push(&mut self, message: Box<dyn Message>, bits_required: usize, reliable: bool) -> MessageId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let queued = QueuedMessage {
            message,
            bits_required,
            time_last_sent: None,
            fragmented: false,
        };
        if reliable {
            self.reliable.insert(id, queued);
        } else {
            self.unreliable.insert(id, queued);
        }
        id
    }

    pub fn is_empty(&self) -> bool {
        self.reliable.is_empty() && self.unreliable.is_empty()
    }

    pub fn reliable_len(&self) -> usize {
        self.reliable.len()
    }

    pub fn unreliable_len(&self) -> usize {
        self.unreliable.len()
    }

    /// Whether reliable messages have been sent and await acknowledgement
    pub fn reliable_in_flight(&self) -> bool {
        self.reliable.values().any(|m| m.time_last_sent.is_some())
    }

    pub fn reliable(&self) -> impl Iterator<Item = (MessageId, &QueuedMessage)> {
        self.reliable.iter().map(|(id, m)| (*id, m))
    }

    pub fn unreliable(&self) -> impl Iterator<Item = (MessageId, &QueuedMessage)> {
        self.unreliable.iter().map(|(id, m)| (*id, m))
    }

    pub fn reliable_mut(&mut self, id: MessageId) -> Option<&mut QueuedMessage> {
        self.reliable.get_mut(&id)
    }

    pub fn unreliable_mut(&mut self, id: MessageId) -> Option<&mut QueuedMessage> {
        self.unreliable.get_mut(&id)
    }

    pub fn remove_reliable(&mut self, id: MessageId) -> Option<QueuedMessage> {
        self.reliable.remove(&id)
    }

    pub fn remove_unreliable(&mut self, id: MessageId) -> Option<QueuedMessage> {
        self.unreliable.remove(&id)
    }

    /// Stamp reliable `ids` as sent at `now`
    pub fn mark_sent(&mut self, ids: &[MessageId], now: f32) {
        for id in ids {
            if let Some(queued) = self.reliable.get_mut(id) {
                queued.time_last_sent = Some(now);
            }
        }
    }

    /// Drop everything, keeping the id counter
    pub fn clear(&mut self) {
        self.reliable.clear();
        self.unreliable.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stream::Stream;
    use crate::error::Result;
    use std::any::Any;

    #[derive(Debug, Default)]
    struct Nop;

    impl Message for Nop {
        fn message_type(&self) -> u8 {
            0
        }

        fn serialize(&mut self, _stream: &mut dyn Stream) -> Result<()> {
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_ids_shared_across_classes() {
        let mut queue = MessageQueue::new();
        assert_eq!(queue.push(Box::new(Nop), 0, true), 1);
        assert_eq!(queue.push(Box::new(Nop), 0, false), 2);
        assert_eq!(queue.push(Box::new(Nop), 0, true), 3);
        let reliable: Vec<_> = queue.reliable().map(|(id, _)| id).collect();
        assert_eq!(reliable, vec![1, 3]);
        assert_eq!(queue.unreliable_len(), 1);
    }

    #[test]
    fn test_in_flight_until_removed() {
        let mut queue = MessageQueue::new();
        let id = queue.push(Box::new(Nop), 0, true);
        assert!(!queue.reliable_in_flight());
        queue.mark_sent(&[id], 1.5);
        assert!(queue.reliable_in_flight());
        assert!(queue.remove_reliable(id).is_some());
        assert!(!queue.reliable_in_flight());
        assert!(queue.is_empty());
    }
}
