use crate::lifetime::StaticLifetime;
use crate::scheduler::queue::TaskQueue;
use crate::scheduler::task::Task;
use crate::scheduler::topology::Topology;
use crate::scheduler::worker::Worker;
use crate::scheduler::{CURRENT_NODE_ID, NodeID, Scheduler};
use event_listener::{Event, Listener, listener};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

// Batches this small are never grouped; they cannot swamp the queues.
const GROUPING_SMALL_FACTOR: usize = 2;

const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// State shared between the scheduler facade and its workers.
pub(super) struct SchedulerCore {
    pub(super) queues: Vec<Arc<TaskQueue>>,
    active: AtomicBool,
    scheduled_tasks: AtomicU64,
    finished_tasks: AtomicU64,
    drain_ev: Event,
}

impl SchedulerCore {
    #[inline]
    pub(super) fn active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Multi-threaded scheduler: one task queue per (real or simulated)
/// NUMA node, one worker per core bound to its node.
pub struct NodeQueueScheduler {
    topology: Topology,
    core: Arc<SchedulerCore>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeQueueScheduler {
    pub fn new(topology: Topology) -> Self {
        let queues = (0..topology.num_nodes())
            .map(|node| Arc::new(TaskQueue::new(node as NodeID)))
            .collect();
        NodeQueueScheduler {
            topology,
            core: Arc::new(SchedulerCore {
                queues,
                active: AtomicBool::new(false),
                scheduled_tasks: AtomicU64::new(0),
                finished_tasks: AtomicU64::new(0),
                drain_ev: Event::new(),
            }),
            worker_handles: Mutex::new(vec![]),
        }
    }

    /// Create the scheduler, leak it and start its workers.
    pub fn start_static(topology: Topology) -> &'static Self {
        let scheduler = StaticLifetime::new_static(NodeQueueScheduler::new(topology));
        scheduler.begin();
        scheduler
    }

    /// Start one worker per core, each bound to its node's queue.
    pub fn begin(&self) {
        if self.core.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut handles = self.worker_handles.lock();
        let mut worker_id = 0;
        for node in 0..self.topology.num_nodes() {
            for _ in 0..self.topology.workers_per_node() {
                let worker = Worker::new(
                    worker_id,
                    node as NodeID,
                    worker_id,
                    Arc::clone(&self.core.queues[node]),
                    Arc::clone(&self.core),
                );
                handles.push(worker.start());
                worker_id += 1;
            }
        }
        log::info!(
            "node queue scheduler started: {} nodes, {} workers",
            self.topology.num_nodes(),
            self.topology.worker_count()
        );
    }

    #[inline]
    pub fn topology(&self) -> Topology {
        self.topology
    }

    #[inline]
    pub fn queues(&self) -> &[Arc<TaskQueue>] {
        &self.core.queues
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.topology.worker_count()
    }

    /// Pick the queue for a task: an explicit preference wins, a
    /// scheduling worker keeps the task on its own node, everyone else
    /// goes to the node with the lowest queue pressure.
    pub fn determine_queue_id(&self, preferred: NodeID) -> NodeID {
        if preferred != CURRENT_NODE_ID {
            debug_assert!((preferred as usize) < self.core.queues.len());
            return preferred;
        }
        if let Some(worker) = Worker::current()
            && worker.belongs_to(&self.core)
        {
            return worker.node_id();
        }
        self.core
            .queues
            .iter()
            .min_by_key(|queue| queue.estimate_load())
            .map(|queue| queue.node_id())
            .unwrap_or(0)
    }

    /// Number of chains a batch of independent tasks is folded into.
    ///
    /// Small batches are not grouped at all (returns the worker count,
    /// which `group_tasks` treats as "leave everything parallel").
    /// Under idle queues the count approaches the worker count; the
    /// more work is already queued, the fewer chains are built.
    pub fn determine_group_count(&self, tasks: &[Arc<Task>]) -> usize {
        let worker_count = self.worker_count().max(1);
        if tasks.len() <= worker_count * GROUPING_SMALL_FACTOR {
            return worker_count;
        }
        let queued: usize = self
            .core
            .queues
            .iter()
            .map(|queue| queue.estimate_load())
            .sum();
        let load_per_worker = queued / worker_count;
        (worker_count / (1 + load_per_worker)).max(1)
    }
}

impl Scheduler for NodeQueueScheduler {
    #[inline]
    fn on_task_scheduled(&self) {
        debug_assert!(self.active(), "schedule on inactive scheduler");
        self.core.scheduled_tasks.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    fn on_task_done(&self) {
        self.core.finished_tasks.fetch_add(1, Ordering::AcqRel);
        self.core.drain_ev.notify(usize::MAX);
    }

    fn schedule_ready(&self, task: Arc<Task>) {
        let queue_id = self.determine_queue_id(task.preferred_node());
        let priority = task.priority();
        if task.try_mark_enqueued() {
            self.core.queues[queue_id as usize].push(task, priority);
        }
    }

    fn wait_for_tasks(&self, tasks: &[Arc<Task>]) {
        if let Some(worker) = Worker::current()
            && worker.belongs_to(&self.core)
        {
            worker.wait_for_tasks(tasks);
            return;
        }
        for task in tasks {
            task.wait_done();
        }
    }

    fn wait_for_all_tasks(&self) {
        loop {
            let finished = self.core.finished_tasks.load(Ordering::Acquire);
            let scheduled = self.core.scheduled_tasks.load(Ordering::Acquire);
            if finished >= scheduled {
                return;
            }
            listener!(self.core.drain_ev => l);
            if self.core.finished_tasks.load(Ordering::Acquire)
                >= self.core.scheduled_tasks.load(Ordering::Acquire)
            {
                return;
            }
            l.wait_timeout(DRAIN_CHECK_INTERVAL);
        }
    }

    /// Fold a large batch of independent tasks into
    /// `determine_group_count` round-robin chains: task `k` becomes
    /// the predecessor of task `k + group_count`. Batches containing
    /// tasks with existing dependencies are left untouched.
    fn group_tasks(&self, tasks: &[Arc<Task>]) {
        if tasks.iter().any(|task| task.has_dependencies()) {
            return;
        }
        let group_count = self.determine_group_count(tasks);
        if group_count == 0 || tasks.len() <= group_count {
            return;
        }
        for i in 0..tasks.len() - group_count {
            tasks[i].set_as_predecessor_of(&tasks[i + group_count]);
        }
    }

    #[inline]
    fn active(&self) -> bool {
        self.core.active()
    }

    /// Drain in-flight work, stop and join all workers.
    fn finish(&self) {
        if !self.active() {
            return;
        }
        self.wait_for_all_tasks();
        self.core.active.store(false, Ordering::SeqCst);
        for queue in &self.core.queues {
            queue.new_task_ev.notify(usize::MAX);
        }
        let mut handles = self.worker_handles.lock();
        for handle in handles.drain(..) {
            handle.join().unwrap();
        }
        log::info!("node queue scheduler finished");
    }
}

impl Drop for NodeQueueScheduler {
    fn drop(&mut self) {
        if self.active() {
            self.finish();
        }
    }
}

unsafe impl StaticLifetime for NodeQueueScheduler {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::schedule_and_wait_for_tasks;
    use crate::scheduler::task::SchedulePriority;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn start(nodes: usize, workers_per_node: usize) -> &'static NodeQueueScheduler {
        NodeQueueScheduler::start_static(Topology::fake_numa(nodes, workers_per_node))
    }

    fn stop(scheduler: &'static NodeQueueScheduler) {
        scheduler.finish();
        unsafe {
            StaticLifetime::drop_static(scheduler);
        }
    }

    /// Three tasks chained t1 -> t2 -> t3, scheduled out of order.
    /// Each CAS only succeeds when its predecessor ran first.
    #[test]
    fn test_linear_dependencies() {
        let scheduler = start(2, 2);
        let counter = Arc::new(AtomicU32::new(0));
        let make = |expected: u32, counter: Arc<AtomicU32>| {
            Task::new(move || {
                let res = counter.compare_exchange(
                    expected,
                    expected + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                assert!(res.is_ok());
            })
        };
        let t1 = make(0, Arc::clone(&counter));
        let t2 = make(1, Arc::clone(&counter));
        let t3 = make(2, Arc::clone(&counter));
        t1.set_as_predecessor_of(&t2);
        t2.set_as_predecessor_of(&t3);

        t3.schedule(scheduler);
        t1.schedule(scheduler);
        t2.schedule(scheduler);

        scheduler.wait_for_all_tasks();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        stop(scheduler);
    }

    /// Diamond: t1 -> {t2, t3} -> t4.
    #[test]
    fn test_diamond_dependencies() {
        let scheduler = start(2, 2);
        let counter = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&counter);
        let t1 = Task::new(move || {
            assert!(c.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst).is_ok());
        });
        let c = Arc::clone(&counter);
        let t2 = Task::new(move || {
            c.fetch_add(2, Ordering::SeqCst);
        });
        let c = Arc::clone(&counter);
        let t3 = Task::new(move || {
            c.fetch_add(3, Ordering::SeqCst);
        });
        let c = Arc::clone(&counter);
        let t4 = Task::new(move || {
            assert!(c.compare_exchange(6, 7, Ordering::SeqCst, Ordering::SeqCst).is_ok());
        });
        t1.set_as_predecessor_of(&t2);
        t1.set_as_predecessor_of(&t3);
        t2.set_as_predecessor_of(&t4);
        t3.set_as_predecessor_of(&t4);

        t4.schedule(scheduler);
        t3.schedule(scheduler);
        t1.schedule(scheduler);
        t2.schedule(scheduler);

        scheduler.wait_for_all_tasks();
        assert_eq!(counter.load(Ordering::SeqCst), 7);
        stop(scheduler);
    }

    /// Ten outer tasks each spawn three jobs and wait for them.
    #[test]
    fn test_nested_spawn_and_wait() {
        let scheduler = start(2, 2);
        let counter = Arc::new(AtomicU32::new(0));
        let mut outer = vec![];
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            let task = Task::new(move || {
                let mut jobs = vec![];
                for _ in 0..3 {
                    let counter = Arc::clone(&counter);
                    let job = Task::new(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                    job.schedule(scheduler);
                    jobs.push(job);
                }
                scheduler.wait_for_tasks(&jobs);
            });
            task.schedule(scheduler);
            outer.push(task);
        }
        scheduler.finish();
        assert_eq!(counter.load(Ordering::SeqCst), 30);
        unsafe {
            StaticLifetime::drop_static(scheduler);
        }
    }

    /// Even one single worker completes nested spawn-and-wait graphs.
    #[test]
    fn test_single_worker_cooperative_progress() {
        let scheduler = start(1, 1);
        let counter = Arc::new(AtomicU32::new(0));
        let counter2 = Arc::clone(&counter);
        let task = Task::new(move || {
            let mut jobs = vec![];
            for _ in 0..4 {
                let counter = Arc::clone(&counter2);
                let job = Task::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
                job.schedule(scheduler);
                jobs.push(job);
            }
            scheduler.wait_for_tasks(&jobs);
            counter2.fetch_add(10, Ordering::SeqCst);
        });
        task.schedule(scheduler);
        scheduler.finish();
        assert_eq!(counter.load(Ordering::SeqCst), 14);
        unsafe {
            StaticLifetime::drop_static(scheduler);
        }
    }

    /// Grouping on a single queue/worker turns a batch into
    /// `determine_group_count` chains executed round-robin, which on
    /// one group is exactly schedule order.
    #[test]
    fn test_grouping_execution_order() {
        let scheduler = start(1, 1);
        const TASK_COUNT: usize = 50;

        let output = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = vec![];
        for task_id in 0..TASK_COUNT {
            let output = Arc::clone(&output);
            tasks.push(Task::new(move || {
                output.lock().push(task_id);
            }));
        }
        let group_count = scheduler.determine_group_count(&tasks);
        schedule_and_wait_for_tasks(scheduler, &tasks);

        let output = output.lock().clone();
        let mut expected = vec![];
        for group_id in 0..group_count {
            let mut task_id = group_id;
            while task_id < TASK_COUNT {
                expected.push(task_id);
                task_id += group_count;
            }
        }
        assert_eq!(output, expected);
        stop(scheduler);
    }

    /// Grouping shrinks with queue pressure and is skipped for small
    /// batches and already-wired DAGs.
    #[test]
    fn test_load_sensitive_group_count() {
        let scheduler = start(1, 2);
        let small: Vec<_> = (0..3).map(|_| Task::new(|| {})).collect();
        assert_eq!(
            scheduler.determine_group_count(&small),
            scheduler.worker_count()
        );

        let batch: Vec<_> = (0..64).map(|_| Task::new(|| {})).collect();
        let idle_groups = scheduler.determine_group_count(&batch);
        assert_eq!(idle_groups, scheduler.worker_count());

        // Pile up slow tasks, then re-evaluate.
        let slow: Vec<_> = (0..64)
            .map(|_| {
                Task::new(|| {
                    std::thread::sleep(Duration::from_millis(5));
                })
            })
            .collect();
        for task in &slow {
            task.schedule(scheduler);
        }
        let loaded_groups = scheduler.determine_group_count(&batch);
        assert!(loaded_groups <= idle_groups);

        // Tasks with existing edges are never regrouped.
        let wired: Vec<_> = (0..32).map(|_| Task::new(|| {})).collect();
        wired[0].set_as_predecessor_of(&wired[1]);
        scheduler.group_tasks(&wired);
        assert!(!wired[2].has_dependencies());

        scheduler.finish();
        unsafe {
            StaticLifetime::drop_static(scheduler);
        }
    }

    /// Tasks flagged non-stealable stay on their preferred node.
    #[test]
    fn test_stealable_flag_respected_across_nodes() {
        let scheduler = start(2, 1);
        let node_seen = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = vec![];
        for _ in 0..8 {
            let node_seen = Arc::clone(&node_seen);
            let task = Task::new(move || {
                let node = Worker::current().map(|w| w.node_id());
                node_seen.lock().push(node);
                std::thread::sleep(Duration::from_millis(1));
            });
            task.set_stealable(false);
            task.schedule_on(scheduler, 1, SchedulePriority::Default);
            tasks.push(task);
        }
        scheduler.wait_for_tasks(&tasks);
        for node in node_seen.lock().iter() {
            assert_eq!(*node, Some(1));
        }
        stop(scheduler);
    }

    /// High-priority tasks overtake default ones on a single worker.
    #[test]
    fn test_priority_order_on_single_worker() {
        let scheduler = start(1, 1);
        let order = Arc::new(Mutex::new(Vec::new()));
        // Keep the only worker busy while the queue fills up.
        let gate = Task::new(|| std::thread::sleep(Duration::from_millis(50)));
        gate.schedule(scheduler);
        let mut tasks = vec![];
        for i in 0..4 {
            let order = Arc::clone(&order);
            let task = Task::new(move || order.lock().push(i));
            let priority = if i >= 2 {
                SchedulePriority::High
            } else {
                SchedulePriority::Default
            };
            task.schedule_on(scheduler, CURRENT_NODE_ID, priority);
            tasks.push(task);
        }
        scheduler.finish();
        let order = order.lock().clone();
        assert_eq!(order, vec![2, 3, 0, 1]);
        unsafe {
            StaticLifetime::drop_static(scheduler);
        }
    }

    /// Scheduling an already-scheduled task is a no-op.
    #[test]
    fn test_double_schedule_is_noop() {
        let scheduler = start(1, 1);
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        let task = Task::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        task.schedule(scheduler);
        task.schedule(scheduler);
        task.wait_done();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        stop(scheduler);
    }
}
