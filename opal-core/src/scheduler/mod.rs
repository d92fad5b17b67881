//! NUMA-aware task scheduling.
//!
//! Everything that needs to be processed is encapsulated in tasks.
//! Tasks form directed acyclic graphs: a task with predecessors is not
//! enqueued until all of them finished. Ready tasks are pushed into
//! per-node queues and pulled out by workers; a worker that finishes a
//! task tries to run the task's now-ready successors before pulling
//! new work from the queues.
//!
//! Jobs can be spawned from anywhere (including from inside a running
//! task) to parallelize work. A worker that waits for such jobs keeps
//! pulling tasks from the queues instead of idling, so even a
//! single-worker scheduler makes progress on nested task graphs.
//!
//! Work stealing is deliberately simple: a worker that finds its local
//! queue empty checks the queues of other nodes and pulls a stealable
//! task from there. If nothing can be stolen, the worker sleeps on its
//! local queue's event with a growing timeout.

pub mod immediate;
pub mod node_queue;
pub mod queue;
pub mod task;
pub mod topology;
pub mod worker;

use crate::scheduler::task::Task;
use std::sync::Arc;

pub type NodeID = u32;
pub type WorkerID = usize;

/// Sentinel preferred-node value: place the task on the node of the
/// scheduling worker, or on the least-loaded node when the caller is
/// not a worker.
pub const CURRENT_NODE_ID: NodeID = NodeID::MAX;

/// Common surface of the immediate and the node-queue scheduler.
///
/// Tasks keep a reference to the scheduler they were scheduled on, so
/// schedulers are used through `&'static` references (leaked via
/// [`crate::lifetime::StaticLifetime`] and dropped explicitly).
pub trait Scheduler: Send + Sync {
    /// A task entered this scheduler (it was scheduled, though it may
    /// still wait for predecessors).
    fn on_task_scheduled(&self);

    /// A task previously counted by `on_task_scheduled` reached DONE.
    fn on_task_done(&self);

    /// Deliver a task whose predecessor count reached zero.
    fn schedule_ready(&self, task: Arc<Task>);

    /// Block until all given tasks are DONE. Must be callable from
    /// inside a running task without deadlocking.
    fn wait_for_tasks(&self, tasks: &[Arc<Task>]);

    /// Block until every scheduled task is DONE.
    fn wait_for_all_tasks(&self);

    /// Transform a batch of independent tasks into a bounded number of
    /// linear chains to cap concurrency. Default: no grouping.
    fn group_tasks(&self, tasks: &[Arc<Task>]) {
        let _ = tasks;
    }

    fn active(&self) -> bool;

    /// Drain in-flight work and shut down. No task is aborted.
    fn finish(&self);
}

/// Group, schedule and wait for a batch of tasks.
pub fn schedule_and_wait_for_tasks(scheduler: &'static dyn Scheduler, tasks: &[Arc<Task>]) {
    scheduler.group_tasks(tasks);
    for task in tasks {
        task.schedule(scheduler);
    }
    scheduler.wait_for_tasks(tasks);
}
