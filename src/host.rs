//! The host execution context.
//!
//! A [`HostContext`] is the per-process substrate a dataflow runtime
//! schedules on: it binds an allocator, a work queue, the shared-context
//! registry, and a diagnostic sink, and it is the factory for every async
//! value in the system. Kernels receive it as an ambient collaborator and
//! use it to allocate, submit work, synchronize on futures, and poll for
//! cooperative cancellation.
//!
//! Each live context occupies one slot in a process-global table of at
//! most [`MAX_HOST_CONTEXTS`] entries; async values record their owner's
//! slot index so their destructor can free them through the allocator that
//! made them.

use std::alloc::Layout;
use std::any::Any;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::allocator::{HostAllocator, SystemAllocator};
use crate::async_ref::{AsyncValueRef, Chain};
use crate::async_value::AsyncValue;
use crate::diagnostic::{Diagnostic, DiagnosticHandler};
use crate::error::{Error, Result};
use crate::parallel_for;
use crate::refcount::Ref;
use crate::shared_context::{shared_context_id, SharedContext, SharedContextManager, SharedContextType};
use crate::work_queue::{TaskFunction, ThreadWorkQueue, WorkQueue, WorkQueueConfig};

/// Maximum number of live host contexts per process. Indices fit in a
/// byte so other subsystems can fold them into small-pointer encodings.
pub const MAX_HOST_CONTEXTS: usize = 256;

/// Slot index of the context that owns a value.
pub(crate) type HostId = u8;

/// Monotone; slot indices are never reused.
static NEXT_INSTANCE_INDEX: AtomicUsize = AtomicUsize::new(0);

static HOST_TABLE: Lazy<RwLock<Vec<Option<Weak<HostState>>>>> =
    Lazy::new(|| RwLock::new(vec![None; MAX_HOST_CONTEXTS]));

/// Everything a host context shares with the values and tasks it spawned.
/// Field order is teardown order: registry, then queue, then allocator,
/// so late-running drops in one layer can still use the layers below it.
pub(crate) struct HostState {
    diag_handler: DiagnosticHandler,
    shared_contexts: SharedContextManager,
    work_queue: Box<dyn WorkQueue>,
    allocator: Box<dyn HostAllocator>,
    /// Null, or one counted reference to an error-state value.
    cancel_value: AtomicPtr<AsyncValue>,
    instance_index: HostId,
}

impl HostState {
    pub(crate) fn enqueue(&self, task: TaskFunction) {
        self.work_queue.enqueue(task);
    }
}

/// The per-process execution substrate. See the module docs.
pub struct HostContext {
    state: Arc<HostState>,
    /// Always-available sentinel; dropped first at teardown so its
    /// deallocation still finds the allocator alive.
    ready_chain: Option<AsyncValueRef<Chain>>,
}

impl HostContext {
    /// Create a context from explicit collaborators.
    ///
    /// # Panics
    ///
    /// Panics if [`MAX_HOST_CONTEXTS`] contexts have already been created
    /// in this process; running out of instance slots is fatal.
    pub fn new(
        diag_handler: DiagnosticHandler,
        allocator: Box<dyn HostAllocator>,
        work_queue: Box<dyn WorkQueue>,
    ) -> Self {
        let index = NEXT_INSTANCE_INDEX.fetch_add(1, Ordering::Relaxed);
        assert!(
            index < MAX_HOST_CONTEXTS,
            "created too many host contexts (limit {MAX_HOST_CONTEXTS})"
        );

        let state = Arc::new(HostState {
            diag_handler,
            shared_contexts: SharedContextManager::new(),
            work_queue,
            allocator,
            cancel_value: AtomicPtr::new(ptr::null_mut()),
            instance_index: index as HostId,
        });
        HOST_TABLE.write()[index] = Some(Arc::downgrade(&state));

        let mut host = HostContext {
            state,
            ready_chain: None,
        };
        host.ready_chain = Some(host.make_available_async_value(Chain));
        debug!(instance = index, "host context created");
        host
    }

    /// A context over the system allocator and a default-sized
    /// work-stealing queue, logging diagnostics through `tracing`.
    pub fn new_default() -> Self {
        Self::new(
            Box::new(|diagnostic: &Diagnostic| tracing::error!("{}", diagnostic)),
            Box::new(SystemAllocator),
            Box::new(ThreadWorkQueue::new(WorkQueueConfig::default())),
        )
    }

    /// This context's slot in the process-global table.
    pub fn instance_index(&self) -> usize {
        self.state.instance_index as usize
    }

    pub(crate) fn state_arc(&self) -> Arc<HostState> {
        Arc::clone(&self.state)
    }

    // === Memory =========================================================

    /// Allocate `size` bytes aligned to `align` through the context's
    /// allocator.
    pub fn allocate_bytes(&self, size: usize, align: usize) -> NonNull<u8> {
        self.state.allocator.allocate(size, align)
    }

    /// Release an allocation made through [`HostContext::allocate_bytes`].
    pub fn deallocate_bytes(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        self.state.allocator.deallocate(ptr, size, align);
    }

    // === Async value construction =======================================

    fn construct_value(&self, value: AsyncValue) -> Ref<AsyncValue> {
        let layout = Layout::new::<AsyncValue>();
        let ptr = self
            .state
            .allocator
            .allocate(layout.size(), layout.align())
            .cast::<AsyncValue>();
        unsafe {
            ptr.as_ptr().write(value);
            Ref::from_raw(ptr)
        }
    }

    /// An unresolved value whose payload will be a `T`.
    pub fn make_unconstructed_async_value<T: Send + Sync + 'static>(&self) -> AsyncValueRef<T> {
        AsyncValueRef::new(self.construct_value(AsyncValue::unresolved(self.state.instance_index)))
    }

    /// A value already resolved to `value`.
    pub fn make_available_async_value<T: Send + Sync + 'static>(&self, value: T) -> AsyncValueRef<T> {
        AsyncValueRef::new(self.construct_value(AsyncValue::available(
            self.state.instance_index,
            Box::new(value),
        )))
    }

    /// A value already resolved to an error.
    pub fn make_error_async_value(&self, diagnostic: impl Into<Diagnostic>) -> Ref<AsyncValue> {
        self.construct_value(AsyncValue::new_error(
            self.state.instance_index,
            diagnostic.into(),
        ))
    }

    /// An indirect value: unresolved until it is forwarded to another
    /// value, whose resolution it then adopts transparently.
    pub fn make_indirect_async_value(&self) -> Ref<AsyncValue> {
        self.construct_value(AsyncValue::indirect(self.state.instance_index))
    }

    /// A fresh reference to the always-available sentinel.
    pub fn ready_chain(&self) -> AsyncValueRef<Chain> {
        self.ready_chain
            .as_ref()
            .expect("ready chain lives as long as the context")
            .clone()
    }

    // === Concurrency ====================================================

    /// Submit non-blocking work to the queue.
    pub fn enqueue_work(&self, work: impl FnOnce() + Send + 'static) {
        self.state.work_queue.enqueue(TaskFunction::new(work));
    }

    /// Submit work that may block on I/O. Returns false if the blocking
    /// pool rejected it.
    pub fn enqueue_blocking_work(&self, work: impl FnOnce() + Send + 'static) -> bool {
        self.state
            .work_queue
            .try_enqueue_blocking(TaskFunction::new(work), true)
            .is_none()
    }

    /// The work queue's self-reported degree of parallelism.
    pub fn parallelism_level(&self) -> u32 {
        self.state.work_queue.parallelism_level()
    }

    /// Block until every value in `values` is resolved.
    pub fn await_values(&self, values: &[Ref<AsyncValue>]) {
        self.state.work_queue.await_all(values);
    }

    /// Block until all submitted tasks and their transitively enqueued
    /// continuations have completed.
    pub fn quiesce(&self) {
        self.state.work_queue.quiesce();
    }

    /// Run `callee` once every value in `values` is resolved: now, on the
    /// calling thread, if they all are already; otherwise on the thread
    /// that resolves the last one. Error inputs count as resolved and do
    /// not short-circuit; `callee` inspects states itself.
    pub fn run_when_ready(&self, values: &[Ref<AsyncValue>], callee: impl FnOnce() + Send + 'static) {
        let unavailable: Vec<&Ref<AsyncValue>> =
            values.iter().filter(|value| !value.is_available()).collect();

        if unavailable.is_empty() {
            callee();
            return;
        }
        if unavailable.len() == 1 {
            unavailable[0].and_then(callee);
            return;
        }

        struct CounterAndCallee {
            counter: AtomicUsize,
            callee: Mutex<Option<Box<dyn FnOnce() + Send>>>,
        }

        let data = Arc::new(CounterAndCallee {
            counter: AtomicUsize::new(unavailable.len()),
            callee: Mutex::new(Some(Box::new(callee))),
        });

        for value in unavailable {
            let data = Arc::clone(&data);
            value.and_then(move || {
                // acq_rel: the producer writes on every input happen
                // before the callee runs.
                if data.counter.fetch_sub(1, Ordering::AcqRel) != 1 {
                    return;
                }
                if let Some(callee) = data.callee.lock().take() {
                    callee();
                }
            });
        }
    }

    /// Partition `[0, n)` into blocks and run `compute(lo, hi)` for each
    /// across the work queue, with the calling thread participating. Block
    /// size is `max(min_block_size, n / (4 * parallelism))`; when a single
    /// block covers everything, both callbacks run synchronously on the
    /// caller. `on_done` runs exactly once, after every block completed.
    pub fn parallel_for(
        &self,
        total: usize,
        compute: impl Fn(usize, usize) + Send + Sync + 'static,
        on_done: impl FnOnce() + Send + 'static,
        min_block_size: usize,
    ) {
        parallel_for::parallel_for(self, total, Box::new(compute), Box::new(on_done), min_block_size);
    }

    // === Errors and cancellation ========================================

    /// Funnel a diagnostic into the sink installed at construction.
    pub fn emit_error(&self, diagnostic: Diagnostic) {
        (self.state.diag_handler)(&diagnostic);
    }

    /// Install `message` as the context-wide cancellation value. The first
    /// caller wins; later calls drop their error value. Running tasks are
    /// not interrupted; kernels observe the value at safe points.
    pub fn cancel_execution(&self, message: &str) {
        let error_value = self.make_error_async_value(Diagnostic::new(message));
        let raw = Ref::into_raw(error_value).as_ptr();
        // Release publishes the error value to acquire loads; on failure
        // nothing was published, so relaxed is enough.
        match self.state.cancel_value.compare_exchange(
            ptr::null_mut(),
            raw,
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => debug!(reason = message, "execution cancelled"),
            Err(_) => unsafe {
                drop(Ref::from_raw(NonNull::new_unchecked(raw)));
            },
        }
    }

    /// Clear the cancellation value, making the context usable again.
    pub fn restart(&self) {
        // acq_rel: this thread sees the cancelling thread's writes and
        // the drop below is ordered after the swap.
        let previous = self
            .state
            .cancel_value
            .swap(ptr::null_mut(), Ordering::AcqRel);
        if let Some(previous) = NonNull::new(previous) {
            unsafe { drop(Ref::from_raw(previous)) };
        }
    }

    /// The current cancellation value, if execution has been cancelled.
    ///
    /// Must not race [`HostContext::restart`]: the returned reference is
    /// taken on the slot's own reference, which `restart` releases.
    pub fn cancel_value(&self) -> Option<Ref<AsyncValue>> {
        NonNull::new(self.state.cancel_value.load(Ordering::Acquire))
            .map(|ptr| unsafe { Ref::clone_from_raw(ptr) })
    }

    /// Safe-point poll for kernels: fails with [`Error::Cancelled`] while
    /// a cancellation value is installed.
    pub fn check_cancellation(&self) -> Result<()> {
        match self.cancel_value() {
            Some(cancel) => Err(Error::Cancelled {
                message: cancel.error().message.clone(),
            }),
            None => Ok(()),
        }
    }

    // === Shared contexts ================================================

    /// The singleton stored in shared-context slot `id`, constructing it
    /// with `factory` if this is the first call. `factory` runs at most
    /// once per (context, id); concurrent callers block until it returns.
    ///
    /// # Panics
    ///
    /// Panics if `id` is outside the registry's fixed capacity.
    pub fn get_or_create_shared(
        &self,
        id: usize,
        factory: impl FnOnce(&HostContext) -> Box<dyn SharedContext>,
    ) -> &dyn SharedContext {
        self.state.shared_contexts.get_or_create(self, id, factory)
    }

    /// Typed accessor over [`HostContext::get_or_create_shared`], using
    /// the dense id assigned to `T` and `T`'s own factory.
    pub fn shared_context<T: SharedContextType>(&self) -> &T {
        let id = shared_context_id::<T>();
        self.get_or_create_shared(id, |host| Box::new(T::create(host)))
            .as_any()
            .downcast_ref::<T>()
            .expect("shared context slot holds a different type")
    }
}

impl Drop for HostContext {
    fn drop(&mut self) {
        // The ready chain and the cancel value free themselves through the
        // allocator, so they must die while the table slot still resolves.
        self.ready_chain = None;
        self.restart();
        // Tasks still in flight may hold values with the same constraint.
        self.state.work_queue.quiesce();
        HOST_TABLE.write()[self.state.instance_index as usize] = None;
        debug!(
            instance = self.state.instance_index as usize,
            "host context destroyed"
        );
    }
}

/// Run `f` against a live context's shared state, if the slot still
/// resolves.
fn with_host_state<R>(id: HostId, f: impl FnOnce(&HostState) -> R) -> Option<R> {
    let weak = HOST_TABLE.read()[id as usize].clone()?;
    let state = weak.upgrade()?;
    Some(f(&state))
}

/// Free an async value's storage through its owner's allocator. Called
/// from the value's destructor, which is why the owner is identified by
/// slot index rather than by reference.
pub(crate) fn deallocate_value(id: HostId, ptr: NonNull<u8>) {
    let layout = Layout::new::<AsyncValue>();
    let freed = with_host_state(id, |state| {
        state.allocator.deallocate(ptr, layout.size(), layout.align());
    });
    if freed.is_none() {
        // The owning context is gone; leaking beats freeing through a
        // dead allocator.
        warn!(owner = id as usize, "async value outlived its host context");
    }
}

/// Report a panic that escaped a waiter, through the owner's diagnostic
/// sink.
pub(crate) fn report_waiter_panic(id: HostId, cause: &(dyn Any + Send)) {
    let message = if let Some(message) = cause.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = cause.downcast_ref::<String>() {
        message.clone()
    } else {
        "waiter panicked".to_string()
    };
    let diagnostic = Diagnostic::new(format!("async waiter panicked: {message}"));
    let reported = with_host_state(id, |state| (state.diag_handler)(&diagnostic));
    if reported.is_none() {
        warn!("waiter panic outlived its host context: {message}");
    }
}
