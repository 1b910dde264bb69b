use crate::types::OutboundFrame;
use std::collections::VecDeque;

/// Frames sent while the channel is down. Bounded; the oldest frame is
/// dropped to make room.
#[derive(Debug)]
pub(crate) struct Outbox {
    capacity: usize,
    frames: VecDeque<OutboundFrame>,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            frames: VecDeque::new(),
        }
    }

    /// Returns the frame evicted to make room, if any.
    pub fn push(&mut self, frame: OutboundFrame) -> Option<OutboundFrame> {
        let evicted = if self.frames.len() >= self.capacity {
            self.frames.pop_front()
        } else {
            None
        };
        self.frames.push_back(frame);
        evicted
    }

    pub fn pop(&mut self) -> Option<OutboundFrame> {
        self.frames.pop_front()
    }

    /// Puts back a frame that could not be flushed, ahead of everything else.
    pub fn requeue_front(&mut self, frame: OutboundFrame) {
        if self.frames.len() >= self.capacity {
            self.frames.pop_back();
        }
        self.frames.push_front(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }
}
