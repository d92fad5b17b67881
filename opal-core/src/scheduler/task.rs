use crate::scheduler::worker::Worker;
use crate::scheduler::{CURRENT_NODE_ID, NodeID, Scheduler};
use event_listener::{Event, Listener, listener};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

pub type TaskID = u64;

static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SchedulePriority {
    Default = 0,
    High = 1,
}

pub const PRIORITY_COUNT: usize = 2;

impl From<u8> for SchedulePriority {
    #[inline]
    fn from(value: u8) -> Self {
        match value {
            0 => SchedulePriority::Default,
            1 => SchedulePriority::High,
            _ => unreachable!("invalid schedule priority"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TaskState {
    Created = 0,
    /// Scheduled, possibly still waiting for predecessors.
    Scheduled = 1,
    /// Ready and handed to a queue or a worker's next-task slot.
    Enqueued = 2,
    /// Claimed by exactly one executor.
    Assigned = 3,
    Running = 4,
    Done = 5,
}

impl From<u8> for TaskState {
    #[inline]
    fn from(value: u8) -> Self {
        match value {
            0 => TaskState::Created,
            1 => TaskState::Scheduled,
            2 => TaskState::Enqueued,
            3 => TaskState::Assigned,
            4 => TaskState::Running,
            5 => TaskState::Done,
            _ => unreachable!("invalid task state"),
        }
    }
}

/// Node in a task DAG with a callable payload.
///
/// A task becomes ready when its predecessor count reaches zero. On
/// completion all successors are notified; a successor whose count
/// drops to zero is executed eagerly by the finishing worker when
/// possible, otherwise enqueued.
///
/// The payload runs exactly once. Faults inside the payload are the
/// payload's responsibility; results travel through state the caller
/// owns.
pub struct Task {
    id: TaskID,
    self_weak: Weak<Task>,
    payload: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
    state: AtomicU8,
    pending_predecessors: AtomicUsize,
    // Written only before scheduling, read-only afterwards.
    successors: Mutex<Vec<Arc<Task>>>,
    priority: AtomicU8,
    preferred_node: AtomicU32,
    stealable: AtomicBool,
    scheduler: Mutex<Option<&'static dyn Scheduler>>,
    done_ev: Event,
}

impl Task {
    /// Create a job task from a closure.
    pub fn new<F>(f: F) -> Arc<Task>
    where
        F: FnOnce() + Send + 'static,
    {
        Arc::new_cyclic(|self_weak| Task {
            id: TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            self_weak: self_weak.clone(),
            payload: Mutex::new(Some(Box::new(f))),
            state: AtomicU8::new(TaskState::Created as u8),
            pending_predecessors: AtomicUsize::new(0),
            successors: Mutex::new(vec![]),
            priority: AtomicU8::new(SchedulePriority::Default as u8),
            preferred_node: AtomicU32::new(CURRENT_NODE_ID),
            stealable: AtomicBool::new(true),
            scheduler: Mutex::new(None),
            done_ev: Event::new(),
        })
    }

    #[inline]
    fn arc(&self) -> Arc<Task> {
        self.self_weak.upgrade().expect("task already dropped")
    }

    #[inline]
    pub fn id(&self) -> TaskID {
        self.id
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.state() == TaskState::Done
    }

    /// Scheduled with no pending predecessors, not yet claimed.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.pending_predecessors.load(Ordering::Acquire) == 0
            && matches!(self.state(), TaskState::Scheduled | TaskState::Enqueued)
    }

    #[inline]
    pub fn priority(&self) -> SchedulePriority {
        SchedulePriority::from(self.priority.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn preferred_node(&self) -> NodeID {
        self.preferred_node.load(Ordering::Relaxed)
    }

    /// Re-home the task after a steal so successors stay node-local.
    #[inline]
    pub(super) fn set_node(&self, node: NodeID) {
        self.preferred_node.store(node, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_stealable(&self) -> bool {
        self.stealable.load(Ordering::Relaxed)
    }

    /// Restrict the task to queues of its preferred node.
    #[inline]
    pub fn set_stealable(&self, stealable: bool) {
        self.stealable.store(stealable, Ordering::Relaxed);
    }

    #[inline]
    pub(super) fn scheduler(&self) -> Option<&'static dyn Scheduler> {
        *self.scheduler.lock()
    }

    /// Whether the task is wired into a DAG already.
    #[inline]
    pub fn has_dependencies(&self) -> bool {
        self.pending_predecessors.load(Ordering::Acquire) > 0 || !self.successors.lock().is_empty()
    }

    /// Add the edge `self -> successor`. Legal only before either task
    /// begins execution.
    pub fn set_as_predecessor_of(&self, successor: &Arc<Task>) {
        debug_assert!(self.state() < TaskState::Assigned);
        debug_assert!(successor.state() < TaskState::Assigned);
        successor
            .pending_predecessors
            .fetch_add(1, Ordering::AcqRel);
        self.successors.lock().push(Arc::clone(successor));
    }

    /// Schedule on the given scheduler with default placement.
    #[inline]
    pub fn schedule(&self, scheduler: &'static dyn Scheduler) {
        self.schedule_on(scheduler, CURRENT_NODE_ID, SchedulePriority::Default);
    }

    /// Mark the task as scheduled. If it is already ready it is
    /// delivered to a queue (or executed) immediately, otherwise it
    /// waits for its predecessors. Scheduling an already-scheduled
    /// task is a no-op.
    pub fn schedule_on(
        &self,
        scheduler: &'static dyn Scheduler,
        preferred_node: NodeID,
        priority: SchedulePriority,
    ) {
        if self.state() != TaskState::Created {
            return;
        }
        // Everything a finishing predecessor needs (scheduler,
        // placement, bookkeeping) must be in place before the state
        // CAS makes the task deliverable.
        self.priority.store(priority as u8, Ordering::Relaxed);
        self.preferred_node.store(preferred_node, Ordering::Relaxed);
        let scheduler = {
            let mut slot = self.scheduler.lock();
            *slot.get_or_insert(scheduler)
        };
        scheduler.on_task_scheduled();
        if self
            .state
            .compare_exchange(
                TaskState::Created as u8,
                TaskState::Scheduled as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            // Lost a concurrent schedule; rebalance the drain count.
            scheduler.on_task_done();
            return;
        }
        if self.pending_predecessors.load(Ordering::Acquire) == 0 {
            Task::deliver_ready(self.arc());
        }
    }

    /// CAS guard: exactly one delivery (queue push or next-task slot)
    /// wins when the scheduling thread and a finishing predecessor
    /// race.
    #[inline]
    pub(super) fn try_mark_enqueued(&self) -> bool {
        self.state
            .compare_exchange(
                TaskState::Scheduled as u8,
                TaskState::Enqueued as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// CAS guard: exactly one executor claims the task. A task can be
    /// pulled from a queue and simultaneously picked by a waiting
    /// worker draining its dependency set.
    #[inline]
    pub(super) fn try_mark_assigned(&self) -> bool {
        self.state
            .compare_exchange(
                TaskState::Enqueued as u8,
                TaskState::Assigned as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Claim a ready task for direct execution, racing against queue
    /// consumers and pending deliveries.
    #[inline]
    pub(super) fn try_claim(&self) -> bool {
        if self.state() == TaskState::Scheduled {
            // Ready but not delivered yet; take the delivery slot too.
            let _ = self.try_mark_enqueued();
        }
        self.try_mark_assigned()
    }

    /// Run a claimed task: payload, DONE transition, successor
    /// notification, scheduler bookkeeping.
    pub(super) fn execute(task: Arc<Task>) {
        debug_assert_eq!(task.state(), TaskState::Assigned);
        task.state.store(TaskState::Running as u8, Ordering::Release);
        let payload = task.payload.lock().take();
        debug_assert!(payload.is_some(), "task payload executed twice");
        if let Some(payload) = payload {
            payload();
        }
        task.state.store(TaskState::Done as u8, Ordering::Release);
        task.done_ev.notify(usize::MAX);

        let successors = task.successors.lock().clone();
        for successor in successors {
            if successor
                .pending_predecessors
                .fetch_sub(1, Ordering::AcqRel)
                == 1
            {
                Task::deliver_ready(successor);
            }
        }
        if let Some(scheduler) = task.scheduler() {
            scheduler.on_task_done();
        }
    }

    /// Route a task whose predecessor count reached zero. Prefers the
    /// current worker's next-task slot to avoid queue traffic.
    pub(super) fn deliver_ready(task: Arc<Task>) {
        if task.state() != TaskState::Scheduled {
            // Not yet scheduled; `schedule_on` dispatches later.
            return;
        }
        if let Some(worker) = Worker::current() {
            worker.execute_next(task);
            return;
        }
        if let Some(scheduler) = task.scheduler() {
            scheduler.schedule_ready(task);
        }
    }

    /// Block the calling thread until the task is DONE.
    pub fn wait_done(&self) {
        loop {
            if self.is_done() {
                return;
            }
            listener!(self.done_ev => l);
            if self.is_done() {
                return;
            }
            l.wait();
        }
    }
}
