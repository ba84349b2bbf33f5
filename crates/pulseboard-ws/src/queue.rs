//! Outbound buffering while disconnected.
//!
//! Messages sent while the transport is not connected are parked here and
//! flushed, in insertion order, immediately after the next successful
//! (re)connection and strictly before subscription replay.
//!
//! The queue is unbounded and in-memory only; a long outage grows it without
//! limit and a process restart loses it.

use crate::envelope::Envelope;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// FIFO buffer of pending envelopes.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    entries: Mutex<VecDeque<Envelope>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail.
    pub fn push(&self, envelope: Envelope) {
        self.entries.lock().push_back(envelope);
    }

    /// Pop the head. The flush loop calls this until empty so envelopes
    /// enqueued mid-flush are still drained.
    pub fn pop(&self) -> Option<Envelope> {
        self.entries.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fifo_order() {
        let queue = OutboundQueue::new();
        queue.push(Envelope::from(json!({"seq":1})));
        queue.push(Envelope::from(json!({"seq":2})));
        queue.push(Envelope::from(json!({"seq":3})));

        assert_eq!(queue.len(), 3);
        for expected in 1..=3 {
            let env = queue.pop().unwrap();
            assert_eq!(env.data.get("seq"), Some(&json!(expected)));
        }
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_empty_pop() {
        let queue = OutboundQueue::new();
        assert!(queue.pop().is_none());
    }
}
