//! Bounded outbound buffer used while the link is down.

use std::collections::VecDeque;

use roomlink_core::Frame;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::transport::Outbound;

/// Application message waiting for a link.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    /// Target channel.
    pub channel: String,
    /// Event payload.
    pub data: Value,
}

impl QueuedMessage {
    #[must_use]
    pub fn new(channel: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            data,
        }
    }

    fn to_frame(&self) -> Frame {
        Frame::event(self.channel.clone(), self.data.clone())
    }
}

/// FIFO queue that evicts its oldest entry when full.
#[derive(Debug)]
pub struct MessageQueue {
    messages: VecDeque<QueuedMessage>,
    capacity: usize,
}

impl MessageQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Append a message. Returns the evicted oldest entry if the queue was full.
    ///
    /// A zero-capacity queue drops every message.
    pub fn enqueue(&mut self, msg: QueuedMessage) -> Option<QueuedMessage> {
        if self.capacity == 0 {
            tracing::debug!(channel = %msg.channel, "Outbound queue disabled, dropping message");
            return Some(msg);
        }
        let evicted = if self.messages.len() >= self.capacity {
            self.messages.pop_front()
        } else {
            None
        };
        if let Some(old) = &evicted {
            tracing::debug!(channel = %old.channel, "Outbound queue full, evicted oldest message");
        }
        self.messages.push_back(msg);
        evicted
    }

    /// Send queued messages in order until the queue is empty or a send fails.
    ///
    /// A message whose send fails stays at the front. Returns how many were sent.
    pub fn flush(&mut self, outbound: &mpsc::UnboundedSender<Outbound>) -> usize {
        let mut sent = 0;
        while let Some(front) = self.messages.front() {
            if outbound.is_closed() {
                break;
            }
            let text = match front.to_frame().encode() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(channel = %front.channel, error = %e, "Dropping unencodable queued message");
                    self.messages.pop_front();
                    continue;
                }
            };
            if outbound.send(Outbound::Text(text)).is_err() {
                break;
            }
            self.messages.pop_front();
            sent += 1;
        }
        if sent > 0 {
            tracing::debug!(sent, remaining = self.messages.len(), "Flushed outbound queue");
        }
        sent
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Snapshot of queued messages, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        self.messages.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn msg(n: i32) -> QueuedMessage {
        QueuedMessage::new("c", json!(n))
    }

    #[test]
    fn test_overflow_keeps_newest() {
        let mut queue = MessageQueue::new(3);
        for n in 0..3 {
            assert!(queue.enqueue(msg(n)).is_none());
        }
        assert_eq!(queue.enqueue(msg(3)), Some(msg(0)));
        assert_eq!(queue.snapshot(), vec![msg(1), msg(2), msg(3)]);
    }

    #[test]
    fn test_zero_capacity_drops() {
        let mut queue = MessageQueue::new(0);
        assert_eq!(queue.enqueue(msg(1)), Some(msg(1)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_flush_in_order() {
        let mut queue = MessageQueue::new(10);
        for n in 0..3 {
            queue.enqueue(msg(n));
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(queue.flush(&tx), 3);
        assert!(queue.is_empty());

        let mut seen = Vec::new();
        while let Ok(Outbound::Text(text)) = rx.try_recv() {
            seen.push(Frame::decode_str(&text));
        }
        assert_eq!(
            seen,
            (0..3).map(|n| Frame::event("c", json!(n))).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_flush_to_closed_link_keeps_everything() {
        let mut queue = MessageQueue::new(10);
        queue.enqueue(msg(1));
        queue.enqueue(msg(2));
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        assert_eq!(queue.flush(&tx), 0);
        assert_eq!(queue.snapshot(), vec![msg(1), msg(2)]);
    }
}
