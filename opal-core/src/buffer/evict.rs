use crate::buffer::frame::{Frame, FrameState, state_of, version_of};
use crate::buffer::page::PageID;
use crossbeam_queue::SegQueue;
use std::time::Duration;

/// How often the idle purge sweep drops stale items from the queue.
pub const IDLE_EVICTION_QUEUE_PURGE: Duration = Duration::from_millis(1000);

/// Upper bound of items inspected by one purge sweep.
pub const MAX_EVICTION_QUEUE_PURGES: usize = 1024;

/// One eviction candidate. The queue is a hint, not authoritative:
/// the frame may have been re-pinned (version moved on) or already
/// evicted by the time the item is popped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionItem {
    pub page_id: PageID,
    /// Frame version at enqueue time. The candidate is only
    /// actionable while the frame version still matches.
    pub timestamp: u64,
}

impl EvictionItem {
    /// The frame can be evicted through this item: still marked, same
    /// version as when the item was enqueued.
    #[inline]
    pub fn can_evict(&self, state_and_version: u64) -> bool {
        state_of(state_and_version) == FrameState::MarkedForEviction
            && version_of(state_and_version) == self.timestamp
    }

    /// The item carries no information anymore and can be dropped by
    /// the purge sweep.
    #[inline]
    pub fn is_stale(&self, frame: &Frame) -> bool {
        !self.can_evict(frame.state_and_version())
    }
}

/// Lock-free MPMC FIFO of eviction candidates with tentative
/// timestamps, validated against the frame version at dequeue.
#[derive(Default)]
pub struct EvictionQueue {
    queue: SegQueue<EvictionItem>,
}

impl EvictionQueue {
    #[inline]
    pub fn new() -> Self {
        EvictionQueue {
            queue: SegQueue::new(),
        }
    }

    #[inline]
    pub fn push(&self, item: EvictionItem) {
        self.queue.push(item);
    }

    #[inline]
    pub fn pop(&self) -> Option<EvictionItem> {
        self.queue.pop()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
