//! Work submission.
//!
//! The host context talks to its thread pool exclusively through the
//! [`WorkQueue`] trait so embedders can plug in their own pools (a fiber
//! scheduler, a test-only inline queue, an OS-priority-aware pool). The
//! crate ships [`ThreadWorkQueue`], a work-stealing implementation with a
//! separate pool for tasks that may block on I/O.

mod threaded;

pub use threaded::ThreadWorkQueue;

use std::fmt;

use crate::async_value::AsyncValue;
use crate::refcount::Ref;

/// A unit of work submitted to a queue. Runs exactly once, to completion;
/// there is no cancellation of a task that has started.
pub struct TaskFunction(Box<dyn FnOnce() + Send>);

impl TaskFunction {
    pub fn new(work: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(work))
    }

    /// Execute the task, consuming it.
    pub fn run(self) {
        (self.0)()
    }
}

impl fmt::Debug for TaskFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TaskFunction")
    }
}

/// Sizing knobs for [`ThreadWorkQueue`].
#[derive(Debug, Clone)]
pub struct WorkQueueConfig {
    /// Worker threads in the non-blocking pool.
    pub worker_threads: usize,
    /// Threads reserved for tasks that may block on I/O.
    pub blocking_threads: usize,
    /// Queued-but-not-running cap for the blocking pool; admissions beyond
    /// it are rejected back to the caller.
    pub blocking_queue_capacity: usize,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            worker_threads: cpus,
            blocking_threads: cpus.min(4),
            blocking_queue_capacity: 1024,
        }
    }
}

/// Task submission, synchronization, and quiescence for one host context.
///
/// Implementations own their threads and must be internally synchronized.
pub trait WorkQueue: Send + Sync {
    /// Submit a non-blocking task. Returns immediately.
    fn enqueue(&self, task: TaskFunction);

    /// Try to hand off a task that may block on I/O. Returns the task if
    /// the blocking pool cannot accept it: when `allow_queuing` is false
    /// and no blocking thread is idle, or when the blocking queue is full.
    fn try_enqueue_blocking(&self, task: TaskFunction, allow_queuing: bool)
        -> Option<TaskFunction>;

    /// Block the caller until every value in `values` is resolved. The
    /// caller may be drafted to run queued tasks while it waits.
    fn await_all(&self, values: &[Ref<AsyncValue>]);

    /// Block until all submitted tasks, including transitively enqueued
    /// continuations, have completed.
    fn quiesce(&self);

    /// Self-reported degree of parallelism, at least 1. Used only for
    /// sizing heuristics such as parallel-for block selection.
    fn parallelism_level(&self) -> u32;
}
