use std::collections::VecDeque;

use crate::frame::Frame;

/// Bounded FIFO of frames awaiting a live connection. Overflow evicts the
/// oldest entry and bumps a counter; delivery order is insertion order.
#[derive(Debug)]
pub struct FrameQueue {
    items: VecDeque<Frame>,
    capacity: usize,
    dropped: u64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            dropped: 0,
        }
    }

    /// Append a frame, evicting the oldest if the queue is at capacity.
    /// Returns the dropped frame, if any. A zero-capacity queue refuses the
    /// incoming frame instead of evicting.
    pub fn push(&mut self, frame: Frame) -> Option<Frame> {
        if self.items.len() < self.capacity {
            self.items.push_back(frame);
            return None;
        }
        self.dropped += 1;
        match self.items.pop_front() {
            Some(evicted) => {
                self.items.push_back(frame);
                Some(evicted)
            }
            None => Some(frame),
        }
    }

    /// Deliver queued frames in insertion order, stopping at the first sink
    /// failure. The sink returns a rejected frame back; it and everything
    /// after it stay enqueued.
    pub fn drain_into<F>(&mut self, mut sink: F) -> usize
    where
        F: FnMut(Frame) -> Result<(), Frame>,
    {
        let mut delivered = 0;
        while let Some(frame) = self.items.pop_front() {
            match sink(frame) {
                Ok(()) => delivered += 1,
                Err(frame) => {
                    self.items.push_front(frame);
                    break;
                }
            }
        }
        delivered
    }

    pub fn pop_front(&mut self) -> Option<Frame> {
        self.items.pop_front()
    }

    pub fn push_front(&mut self, frame: Frame) {
        self.items.push_front(frame);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total frames evicted by overflow since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u64) -> Frame {
        Frame::new("x").with_field("v", n)
    }

    fn value(f: &Frame) -> u64 {
        f.field("v").and_then(|v| v.as_u64()).unwrap()
    }

    #[test]
    fn push_within_capacity_keeps_all() {
        let mut q = FrameQueue::new(3);
        for n in 0..3 {
            assert!(q.push(frame(n)).is_none());
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.dropped(), 0);
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let mut q = FrameQueue::new(50);
        for n in 0..53 {
            q.push(frame(n));
        }
        assert_eq!(q.len(), 50);
        assert_eq!(q.dropped(), 3);
        // The three oldest are gone; the head is now frame 3.
        assert_eq!(value(&q.pop_front().unwrap()), 3);
    }

    #[test]
    fn overflow_returns_evicted_frame() {
        let mut q = FrameQueue::new(1);
        q.push(frame(0));
        let evicted = q.push(frame(1)).unwrap();
        assert_eq!(value(&evicted), 0);
    }

    #[test]
    fn zero_capacity_refuses_every_frame() {
        let mut q = FrameQueue::new(0);
        for n in 0..3 {
            let refused = q.push(frame(n)).unwrap();
            assert_eq!(value(&refused), n);
        }
        assert!(q.is_empty());
        assert_eq!(q.dropped(), 3);
    }

    #[test]
    fn drain_delivers_in_insertion_order() {
        let mut q = FrameQueue::new(10);
        for n in 0..5 {
            q.push(frame(n));
        }
        let mut seen = Vec::new();
        let delivered = q.drain_into(|f| {
            seen.push(value(&f));
            Ok(())
        });
        assert_eq!(delivered, 5);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert!(q.is_empty());
    }

    #[test]
    fn drain_stops_at_first_failure() {
        let mut q = FrameQueue::new(10);
        for n in 0..5 {
            q.push(frame(n));
        }
        let mut accepted = 0;
        let delivered = q.drain_into(|f| {
            if accepted < 2 {
                accepted += 1;
                Ok(())
            } else {
                Err(f)
            }
        });
        assert_eq!(delivered, 2);
        // The rejected frame and everything after stay queued, in order.
        assert_eq!(q.len(), 3);
        assert_eq!(value(&q.pop_front().unwrap()), 2);
    }

    #[test]
    fn clear_keeps_drop_counter() {
        let mut q = FrameQueue::new(1);
        q.push(frame(0));
        q.push(frame(1));
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.dropped(), 1);
    }
}
