// Copyright 2024-Present the apm-agent authors
// SPDX-License-Identifier: Apache-2.0

//! Bounded FIFO buffer shared by the simple data kinds.
//!
//! Errors, custom events and metric batches all buffer opaque JSON items
//! between harvests. When the queue is full the oldest item is evicted so
//! memory stays bounded under load, and retained batches merged back after a
//! failed send can never grow the buffer past its cap.

use std::collections::VecDeque;

use serde_json::Value;
use tracing::warn;

#[derive(Debug)]
pub struct EventBuffer {
    queue: VecDeque<Value>,
    max_items: usize,
    dropped: u64,
}

impl EventBuffer {
    pub fn new(max_items: usize) -> Self {
        EventBuffer {
            queue: VecDeque::new(),
            max_items,
            dropped: 0,
        }
    }

    /// Appends an item, evicting the oldest one when full.
    pub fn push(&mut self, item: Value) {
        if self.queue.len() >= self.max_items {
            self.queue.pop_front();
            self.dropped += 1;
            warn!(
                "event buffer full ({} items), dropping oldest item",
                self.max_items
            );
        }
        self.queue.push_back(item);
    }

    /// Takes everything buffered so far.
    pub fn drain(&mut self) -> Vec<Value> {
        self.queue.drain(..).collect()
    }

    /// Puts a retained batch back in front of anything buffered since the
    /// failed send. Items that no longer fit are dropped, oldest first.
    pub fn merge(&mut self, items: Vec<Value>) {
        for item in items.into_iter().rev() {
            if self.queue.len() >= self.max_items {
                self.dropped += 1;
                continue;
            }
            self.queue.push_front(item);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Items lost to eviction since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_and_drain_preserve_order() {
        let mut buffer = EventBuffer::new(10);
        buffer.push(json!(1));
        buffer.push(json!(2));
        buffer.push(json!(3));
        assert_eq!(buffer.drain(), vec![json!(1), json!(2), json!(3)]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_full_buffer_evicts_oldest() {
        let mut buffer = EventBuffer::new(2);
        buffer.push(json!("a"));
        buffer.push(json!("b"));
        buffer.push(json!("c"));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.dropped(), 1);
        assert_eq!(buffer.drain(), vec![json!("b"), json!("c")]);
    }

    #[test]
    fn test_merge_puts_retained_items_first() {
        let mut buffer = EventBuffer::new(10);
        buffer.push(json!("new"));
        buffer.merge(vec![json!("old-1"), json!("old-2")]);
        assert_eq!(
            buffer.drain(),
            vec![json!("old-1"), json!("old-2"), json!("new")]
        );
    }

    #[test]
    fn test_merge_is_bounded() {
        let mut buffer = EventBuffer::new(3);
        buffer.push(json!("new-1"));
        buffer.push(json!("new-2"));
        buffer.merge(vec![json!("old-1"), json!("old-2"), json!("old-3")]);
        assert_eq!(buffer.len(), 3);
        assert!(buffer.dropped() > 0);
        // The most recent of the retained items survives, in front.
        assert_eq!(
            buffer.drain(),
            vec![json!("old-3"), json!("new-1"), json!("new-2")]
        );
    }
}
