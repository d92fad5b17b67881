use crate::lifetime::StaticLifetime;
use crate::scheduler::Scheduler;
use crate::scheduler::task::Task;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Single-threaded scheduler that executes every ready task (and its
/// transitively ready successors) synchronously on the caller's
/// thread. No queues, no workers. Used by tests and tools.
#[derive(Default)]
pub struct ImmediateScheduler {
    scheduled_tasks: AtomicU64,
    finished_tasks: AtomicU64,
}

impl ImmediateScheduler {
    #[inline]
    pub fn new() -> Self {
        ImmediateScheduler::default()
    }

    /// Create the scheduler and leak it, matching the lifetime
    /// contract tasks expect.
    pub fn start_static() -> &'static Self {
        StaticLifetime::new_static(ImmediateScheduler::new())
    }
}

impl Scheduler for ImmediateScheduler {
    #[inline]
    fn on_task_scheduled(&self) {
        self.scheduled_tasks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn on_task_done(&self) {
        self.finished_tasks.fetch_add(1, Ordering::Relaxed);
    }

    fn schedule_ready(&self, task: Arc<Task>) {
        if task.try_mark_enqueued() && task.try_mark_assigned() {
            // Successors of the executed task re-enter through
            // `schedule_ready`, so a whole ready subgraph runs here.
            Task::execute(task);
        }
    }

    fn wait_for_tasks(&self, tasks: &[Arc<Task>]) {
        // Everything scheduled has already run; pick up tasks that
        // became ready through predecessors finishing elsewhere.
        loop {
            let mut all_done = true;
            let mut progress = false;
            for task in tasks {
                if task.is_done() {
                    continue;
                }
                all_done = false;
                if task.is_ready() && task.try_claim() {
                    Task::execute(Arc::clone(task));
                    progress = true;
                }
            }
            if all_done {
                return;
            }
            debug_assert!(
                progress,
                "waiting on tasks that cannot make progress on this thread"
            );
            if !progress {
                return;
            }
        }
    }

    #[inline]
    fn wait_for_all_tasks(&self) {
        debug_assert_eq!(
            self.scheduled_tasks.load(Ordering::Relaxed),
            self.finished_tasks.load(Ordering::Relaxed),
            "immediate scheduler left tasks behind"
        );
    }

    #[inline]
    fn active(&self) -> bool {
        true
    }

    #[inline]
    fn finish(&self) {
        self.wait_for_all_tasks();
    }
}

unsafe impl StaticLifetime for ImmediateScheduler {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_linear_chain_runs_synchronously() {
        let scheduler = ImmediateScheduler::start_static();
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

        // Out-of-order scheduling: t3 waits, t1 fires the chain up to
        // the not-yet-scheduled t2, t2 completes everything.
        t3.schedule(scheduler);
        t1.schedule(scheduler);
        t2.schedule(scheduler);

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(t3.is_done());
        scheduler.finish();
        unsafe {
            StaticLifetime::drop_static(scheduler);
        }
    }

    #[test]
    fn test_diamond_runs_synchronously() {
        let scheduler = ImmediateScheduler::start_static();
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

        assert_eq!(counter.load(Ordering::SeqCst), 7);
        scheduler.finish();
        unsafe {
            StaticLifetime::drop_static(scheduler);
        }
    }

    #[test]
    fn test_nested_spawn_without_worker_threads() {
        let scheduler = ImmediateScheduler::start_static();
        let counter = Arc::new(AtomicU32::new(0));
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
        }
        assert_eq!(counter.load(Ordering::SeqCst), 30);
        scheduler.finish();
        unsafe {
            StaticLifetime::drop_static(scheduler);
        }
    }
}
