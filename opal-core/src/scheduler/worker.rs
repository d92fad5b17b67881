use crate::scheduler::node_queue::SchedulerCore;
use crate::scheduler::queue::TaskQueue;
use crate::scheduler::task::Task;
use crate::scheduler::{NodeID, WorkerID};
use crate::thread::spawn_named;
use event_listener::{Listener, listener};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

const MIN_WORKER_SLEEP: Duration = Duration::from_micros(100);
const MAX_WORKER_SLEEP: Duration = Duration::from_millis(4);

thread_local! {
    // On worker threads this references the worker running on the
    // thread; on all other threads it is empty.
    static CURRENT_WORKER: RefCell<Option<Arc<Worker>>> = const { RefCell::new(None) };
}

/// One OS thread bound to one NUMA node.
///
/// The loop: pull from the local queue, steal from peer queues in a
/// fixed rotation, sleep on the local queue's event with a growing
/// timeout when there is nothing to do anywhere.
pub struct Worker {
    id: WorkerID,
    node_id: NodeID,
    cpu_id: usize,
    queue: Arc<TaskQueue>,
    core: Arc<SchedulerCore>,
    // Successor handed over by the task that just finished; executed
    // before pulling from the queue again.
    next_task: Mutex<Option<Arc<Task>>>,
    sleep_nanos: AtomicU64,
}

impl Worker {
    pub(super) fn new(
        id: WorkerID,
        node_id: NodeID,
        cpu_id: usize,
        queue: Arc<TaskQueue>,
        core: Arc<SchedulerCore>,
    ) -> Arc<Worker> {
        Arc::new(Worker {
            id,
            node_id,
            cpu_id,
            queue,
            core,
            next_task: Mutex::new(None),
            sleep_nanos: AtomicU64::new(MIN_WORKER_SLEEP.as_nanos() as u64),
        })
    }

    /// The worker running on the calling thread, if any.
    #[inline]
    pub fn current() -> Option<Arc<Worker>> {
        CURRENT_WORKER.with(|w| w.borrow().clone())
    }

    #[inline]
    pub fn id(&self) -> WorkerID {
        self.id
    }

    #[inline]
    pub fn node_id(&self) -> NodeID {
        self.node_id
    }

    #[inline]
    pub(super) fn belongs_to(&self, core: &Arc<SchedulerCore>) -> bool {
        Arc::ptr_eq(&self.core, core)
    }

    pub(super) fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let worker = Arc::clone(self);
        spawn_named(format!("opal-worker-{}", self.id), move || worker.run())
    }

    fn run(self: Arc<Self>) {
        CURRENT_WORKER.with(|w| *w.borrow_mut() = Some(Arc::clone(&self)));
        self.set_affinity();
        while self.core.active() {
            self.work();
        }
        CURRENT_WORKER.with(|w| *w.borrow_mut() = None);
    }

    fn set_affinity(&self) {
        if let Some(cores) = core_affinity::get_core_ids()
            && !cores.is_empty()
        {
            let core = cores[self.cpu_id % cores.len()];
            if !core_affinity::set_for_current(core) {
                // Not fatal, the scheduler just loses locality.
                log::warn!("worker {} failed to set cpu affinity", self.id);
            }
        }
    }

    /// One scheduling round: acquire a task and run it, or sleep.
    fn work(&self) {
        let mut task = self.next_task.lock().take();
        if task.is_none() {
            task = self.queue.pull();
        }
        if task.is_none() {
            // Simple work stealing without explicitly transferring
            // data between nodes.
            for queue in &self.core.queues {
                if queue.node_id() == self.node_id {
                    continue;
                }
                if let Some(stolen) = queue.steal() {
                    stolen.set_node(self.node_id);
                    task = Some(stolen);
                    break;
                }
            }
        }
        let Some(task) = task else {
            self.sleep();
            return;
        };
        self.sleep_nanos
            .store(MIN_WORKER_SLEEP.as_nanos() as u64, Ordering::Relaxed);
        // Some other executor (e.g. a worker draining its dependency
        // set) may have claimed this task already.
        if !task.try_mark_assigned() {
            return;
        }
        Task::execute(task);
    }

    fn sleep(&self) {
        listener!(self.queue.new_task_ev => l);
        // Re-check after registering to avoid losing a wakeup.
        if let Some(task) = self.queue.pull() {
            if task.try_mark_assigned() {
                Task::execute(task);
            }
            return;
        }
        if !self.core.active() {
            return;
        }
        let nanos = self.sleep_nanos.load(Ordering::Relaxed);
        l.wait_timeout(Duration::from_nanos(nanos));
        let next = (nanos * 2).min(MAX_WORKER_SLEEP.as_nanos() as u64);
        self.sleep_nanos.store(next, Ordering::Relaxed);
    }

    /// Hand over a just-readied successor. Runs before the next queue
    /// pull when the slot is free, otherwise goes through the queue.
    pub(super) fn execute_next(&self, task: Arc<Task>) {
        if !task.try_mark_enqueued() {
            // Lost the delivery race, the task is in a queue already.
            return;
        }
        let mut slot = self.next_task.lock();
        if slot.is_none() {
            *slot = Some(task);
        } else {
            drop(slot);
            let priority = task.priority();
            self.queue.push(task, priority);
        }
    }

    /// Cooperatively wait for the given tasks: execute the ready ones
    /// directly and keep pulling queue work in between, so dependent
    /// jobs in the queues make progress even with a single worker.
    pub(super) fn wait_for_tasks(&self, tasks: &[Arc<Task>]) {
        let mut considered = 0usize;
        loop {
            let mut all_done = true;
            for task in tasks {
                if task.is_done() {
                    continue;
                }
                all_done = false;
                if !task.is_ready() {
                    continue;
                }
                // Give unrelated queued tasks a chance to run too,
                // instead of exclusively serving the waited-on set.
                considered += 1;
                if considered % 5 == 0 {
                    break;
                }
                if task.try_claim() {
                    Task::execute(Arc::clone(task));
                }
            }
            if all_done {
                return;
            }
            self.work();
        }
    }
}
