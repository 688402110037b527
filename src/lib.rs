//! Host execution context for asynchronous dataflow runtimes.
//!
//! `flowhost` is the substrate a dataflow runtime schedules on: a
//! [`HostContext`] binds an allocator, a work-stealing work queue, a
//! shared-context registry, and a diagnostic sink, and manufactures the
//! reference-counted, set-once [`AsyncValue`] futures that kernels produce
//! and consume. On top of those it provides continuation chaining,
//! join-style synchronization ([`HostContext::run_when_ready`]),
//! cooperative cancellation, and a recursive-bisection
//! [`HostContext::parallel_for`].

pub mod allocator;
pub mod async_ref;
pub mod async_value;
pub mod diagnostic;
pub mod error;
pub mod host;
pub mod refcount;
pub mod shared_context;
pub mod work_queue;

mod parallel_for;

pub use allocator::{AllocatorStats, HostAllocator, SystemAllocator, TrackingAllocator};
pub use async_ref::{AsyncValueRef, Chain};
pub use async_value::AsyncValue;
pub use diagnostic::{Diagnostic, DiagnosticHandler, Location};
pub use error::{Error, Result};
pub use host::{HostContext, MAX_HOST_CONTEXTS};
pub use refcount::{Ref, RefCounted};
pub use shared_context::{
    shared_context_id, SharedContext, SharedContextType, MAX_SHARED_CONTEXTS,
};
pub use work_queue::{TaskFunction, ThreadWorkQueue, WorkQueue, WorkQueueConfig};
