//! Work-stealing thread pool.
//!
//! One global injector feeds per-worker deques; idle workers refill from
//! the injector in batches and steal from each other before backing off.
//! Blocking tasks run on a separate, smaller pool fed by a bounded channel
//! so a stalled I/O task can never occupy a compute worker.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use crossbeam_deque::{Injector, Stealer, Worker};
use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use super::{TaskFunction, WorkQueue, WorkQueueConfig};
use crate::async_value::AsyncValue;
use crate::refcount::Ref;

/// State shared between the queue handle, its workers, and in-flight
/// helpers (`await_all`/`quiesce` callers drafted into running tasks).
struct QueueState {
    injector: Injector<TaskFunction>,
    /// Tasks submitted but not yet finished, across both pools. This is
    /// the gauge `quiesce` drains to zero.
    outstanding: AtomicUsize,
    /// Tasks executed over the queue's lifetime.
    tasks_executed: AtomicUsize,
    /// Blocking-pool threads currently parked on the channel.
    idle_blocking: AtomicUsize,
    running: AtomicBool,
    quiesce_lock: Mutex<()>,
    quiesce_cv: Condvar,
}

impl QueueState {
    fn run_task(&self, task: TaskFunction) {
        // A panicking task must not wedge quiesce; the gauge comes down
        // either way.
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.run())).is_err() {
            error!("task panicked on the work queue");
        }
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
        self.finish_task();
    }

    fn finish_task(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.quiesce_lock.lock();
            self.quiesce_cv.notify_all();
        }
    }
}

/// Work-stealing [`WorkQueue`] with a dedicated blocking pool.
pub struct ThreadWorkQueue {
    state: Arc<QueueState>,
    blocking_tx: Option<Sender<TaskFunction>>,
    workers: Vec<JoinHandle<()>>,
    blocking_workers: Vec<JoinHandle<()>>,
    worker_count: usize,
}

impl ThreadWorkQueue {
    pub fn new(config: WorkQueueConfig) -> Self {
        let worker_count = config.worker_threads.max(1);
        let blocking_count = config.blocking_threads.max(1);

        let state = Arc::new(QueueState {
            injector: Injector::new(),
            outstanding: AtomicUsize::new(0),
            tasks_executed: AtomicUsize::new(0),
            idle_blocking: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            quiesce_lock: Mutex::new(()),
            quiesce_cv: Condvar::new(),
        });

        let locals: Vec<Worker<TaskFunction>> =
            (0..worker_count).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<Stealer<TaskFunction>> =
            locals.iter().map(|local| local.stealer()).collect();

        let mut workers = Vec::with_capacity(worker_count);
        for (id, local) in locals.into_iter().enumerate() {
            let state = Arc::clone(&state);
            let others: Vec<Stealer<TaskFunction>> = stealers
                .iter()
                .enumerate()
                .filter(|(other, _)| *other != id)
                .map(|(_, stealer)| stealer.clone())
                .collect();
            let handle = thread::Builder::new()
                .name(format!("flowhost-worker-{id}"))
                .spawn(move || worker_loop(id, local, state, others))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        let (blocking_tx, blocking_rx) = bounded(config.blocking_queue_capacity.max(1));
        let mut blocking_workers = Vec::with_capacity(blocking_count);
        for id in 0..blocking_count {
            let state = Arc::clone(&state);
            let rx: Receiver<TaskFunction> = blocking_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("flowhost-blocking-{id}"))
                .spawn(move || blocking_loop(id, rx, state))
                .expect("failed to spawn blocking worker thread");
            blocking_workers.push(handle);
        }

        Self {
            state,
            blocking_tx: Some(blocking_tx),
            workers,
            blocking_workers,
            worker_count,
        }
    }

    /// Tasks submitted but not yet finished, across both pools.
    pub fn outstanding_tasks(&self) -> usize {
        self.state.outstanding.load(Ordering::Acquire)
    }

    /// Tasks executed over the queue's lifetime.
    pub fn tasks_executed(&self) -> usize {
        self.state.tasks_executed.load(Ordering::Relaxed)
    }
}

impl Default for ThreadWorkQueue {
    fn default() -> Self {
        Self::new(WorkQueueConfig::default())
    }
}

impl WorkQueue for ThreadWorkQueue {
    fn enqueue(&self, task: TaskFunction) {
        self.state.outstanding.fetch_add(1, Ordering::AcqRel);
        self.state.injector.push(task);
    }

    fn try_enqueue_blocking(
        &self,
        task: TaskFunction,
        allow_queuing: bool,
    ) -> Option<TaskFunction> {
        if !allow_queuing && self.state.idle_blocking.load(Ordering::Acquire) == 0 {
            return Some(task);
        }
        self.state.outstanding.fetch_add(1, Ordering::AcqRel);
        let tx = self.blocking_tx.as_ref().expect("blocking pool alive");
        match tx.try_send(task) {
            Ok(()) => None,
            Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => {
                self.state.finish_task();
                Some(task)
            }
        }
    }

    fn await_all(&self, values: &[Ref<AsyncValue>]) {
        let pending: Vec<&Ref<AsyncValue>> =
            values.iter().filter(|value| !value.is_available()).collect();
        if pending.is_empty() {
            return;
        }

        let latch = Arc::new(WaitLatch::new(pending.len()));
        for value in pending {
            let latch = Arc::clone(&latch);
            value.and_then(move || latch.count_down());
        }

        // Help drain the queue while waiting so a caller running on the
        // pool cannot starve the very values it awaits.
        loop {
            if latch.is_open() {
                return;
            }
            if let Some(task) = self.state.injector.steal().success() {
                self.state.run_task(task);
                continue;
            }
            latch.wait_for(Duration::from_millis(1));
        }
    }

    fn quiesce(&self) {
        debug!("quiesce requested");
        loop {
            if self.state.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            if let Some(task) = self.state.injector.steal().success() {
                self.state.run_task(task);
                continue;
            }
            let mut guard = self.state.quiesce_lock.lock();
            if self.state.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            // Timed wait: a task can finish between the gauge probe and
            // the wait, and its notify must not be missed forever.
            self.state
                .quiesce_cv
                .wait_for(&mut guard, Duration::from_millis(1));
        }
    }

    fn parallelism_level(&self) -> u32 {
        self.worker_count as u32
    }
}

impl Drop for ThreadWorkQueue {
    fn drop(&mut self) {
        self.quiesce();
        self.state.running.store(false, Ordering::Release);
        // Closing the channel wakes the blocking pool; the compute workers
        // notice `running` on their next probe.
        self.blocking_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        for handle in self.blocking_workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    id: usize,
    local: Worker<TaskFunction>,
    state: Arc<QueueState>,
    stealers: Vec<Stealer<TaskFunction>>,
) {
    debug!(worker = id, "work queue worker started");
    let backoff = Backoff::new();
    while state.running.load(Ordering::Acquire) {
        if let Some(task) = find_task(&local, &state, &stealers) {
            state.run_task(task);
            backoff.reset();
        } else {
            backoff.snooze();
            if backoff.is_completed() {
                thread::yield_now();
            }
        }
    }
    debug!(worker = id, "work queue worker stopped");
}

fn find_task(
    local: &Worker<TaskFunction>,
    state: &QueueState,
    stealers: &[Stealer<TaskFunction>],
) -> Option<TaskFunction> {
    // Local queue first, then a batch refill from the injector, then
    // stealing from siblings.
    if let Some(task) = local.pop() {
        return Some(task);
    }
    if let Some(task) = state.injector.steal_batch_and_pop(local).success() {
        return Some(task);
    }
    for stealer in stealers {
        if let Some(task) = stealer.steal().success() {
            return Some(task);
        }
    }
    None
}

fn blocking_loop(id: usize, rx: Receiver<TaskFunction>, state: Arc<QueueState>) {
    debug!(worker = id, "blocking worker started");
    loop {
        state.idle_blocking.fetch_add(1, Ordering::AcqRel);
        let received = rx.recv();
        state.idle_blocking.fetch_sub(1, Ordering::AcqRel);
        match received {
            Ok(task) => state.run_task(task),
            Err(_) => break,
        }
    }
    debug!(worker = id, "blocking worker stopped");
}

/// Countdown latch for `await_all`.
struct WaitLatch {
    remaining: Mutex<usize>,
    cv: Condvar,
}

impl WaitLatch {
    fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            cv: Condvar::new(),
        }
    }

    fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        *remaining -= 1;
        if *remaining == 0 {
            self.cv.notify_all();
        }
    }

    fn is_open(&self) -> bool {
        *self.remaining.lock() == 0
    }

    fn wait_for(&self, timeout: Duration) {
        let mut remaining = self.remaining.lock();
        if *remaining > 0 {
            self.cv.wait_for(&mut remaining, timeout);
        }
    }
}
