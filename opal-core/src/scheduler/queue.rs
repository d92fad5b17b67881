use crate::scheduler::task::{PRIORITY_COUNT, SchedulePriority, Task};
use crate::scheduler::NodeID;
use crossbeam_deque::{Injector, Steal};
use crossbeam_utils::CachePadded;
use event_listener::{Event, IntoNotification};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-node multi-producer/multi-consumer work queue holding READY
/// tasks, one lane per priority. High-priority tasks are always served
/// before default-priority ones.
pub struct TaskQueue {
    node_id: NodeID,
    lanes: [Injector<Arc<Task>>; PRIORITY_COUNT],
    // Approximate depth, used for least-loaded queue selection and
    // load-sensitive grouping.
    len: CachePadded<AtomicUsize>,
    /// Sleeping workers of this node wait here for new work.
    pub(super) new_task_ev: Event,
}

impl TaskQueue {
    #[inline]
    pub fn new(node_id: NodeID) -> Self {
        TaskQueue {
            node_id,
            lanes: [Injector::new(), Injector::new()],
            len: CachePadded::new(AtomicUsize::new(0)),
            new_task_ev: Event::new(),
        }
    }

    #[inline]
    pub fn node_id(&self) -> NodeID {
        self.node_id
    }

    /// Approximate number of queued tasks.
    #[inline]
    pub fn estimate_load(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn push(&self, task: Arc<Task>, priority: SchedulePriority) {
        self.lanes[priority as usize].push(task);
        self.len.fetch_add(1, Ordering::Relaxed);
        self.new_task_ev.notify(1.additional());
    }

    #[inline]
    fn pop_lane(&self, priority: SchedulePriority) -> Option<Arc<Task>> {
        loop {
            match self.lanes[priority as usize].steal() {
                Steal::Success(task) => {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    return Some(task);
                }
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    /// Pull a task for a worker of this node.
    pub fn pull(&self) -> Option<Arc<Task>> {
        self.pop_lane(SchedulePriority::High)
            .or_else(|| self.pop_lane(SchedulePriority::Default))
    }

    /// Pull a task for a worker of another node. Only stealable tasks
    /// leave the queue; a non-stealable head is pushed back and the
    /// steal attempt moves on to the next lane instead of spinning on
    /// it.
    pub fn steal(&self) -> Option<Arc<Task>> {
        for priority in [SchedulePriority::High, SchedulePriority::Default] {
            if let Some(task) = self.pop_lane(priority) {
                if task.is_stealable() {
                    return Some(task);
                }
                self.lanes[priority as usize].push(task);
                self.len.fetch_add(1, Ordering::Relaxed);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        let queue = TaskQueue::new(0);
        let low = Task::new(|| {});
        let high = Task::new(|| {});
        queue.push(Arc::clone(&low), SchedulePriority::Default);
        queue.push(Arc::clone(&high), SchedulePriority::High);
        assert_eq!(queue.estimate_load(), 2);
        assert_eq!(queue.pull().unwrap().id(), high.id());
        assert_eq!(queue.pull().unwrap().id(), low.id());
        assert!(queue.pull().is_none());
        assert_eq!(queue.estimate_load(), 0);
    }

    #[test]
    fn test_steal_respects_stealable_flag() {
        let queue = TaskQueue::new(0);
        let pinned = Task::new(|| {});
        pinned.set_stealable(false);
        queue.push(Arc::clone(&pinned), SchedulePriority::Default);
        // A remote worker cannot take the pinned task.
        assert!(queue.steal().is_none());
        // The local worker still can.
        assert_eq!(queue.pull().unwrap().id(), pinned.id());

        let free = Task::new(|| {});
        queue.push(Arc::clone(&free), SchedulePriority::Default);
        assert_eq!(queue.steal().unwrap().id(), free.id());
    }

    #[test]
    fn test_steal_skips_pinned_lane_head() {
        let queue = TaskQueue::new(0);
        let pinned_high = Task::new(|| {});
        pinned_high.set_stealable(false);
        let free_low = Task::new(|| {});
        queue.push(Arc::clone(&pinned_high), SchedulePriority::High);
        queue.push(Arc::clone(&free_low), SchedulePriority::Default);
        // A pinned head on the high lane must not hide stealable work
        // in the default lane.
        assert_eq!(queue.steal().unwrap().id(), free_low.id());
        assert_eq!(queue.estimate_load(), 1);
        assert_eq!(queue.pull().unwrap().id(), pinned_high.id());
    }
}
