//! The set-once asynchronous value cell.
//!
//! An [`AsyncValue`] starts out unresolved, accumulates continuations on a
//! lock-free LIFO stack, and transitions exactly once to a concrete payload
//! or an error diagnostic. Indirect values resolve by linking to another
//! value chosen later; observers see through the link. The cell is
//! type-erased so heterogeneous sets of values can be awaited and joined;
//! [`crate::AsyncValueRef`] layers the payload type back on top.
//!
//! State transitions are published with a release store after a single
//! compare-exchange claims the cell, so a waiter observing a resolved state
//! with acquire ordering also observes every write the producer made first.

use std::any::Any;
use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use crate::diagnostic::Diagnostic;
use crate::error::{Error, Result};
use crate::host::{self, HostId};
use crate::refcount::{Ref, RefCounted};

/// Nothing resolved yet; waiters may be registered.
const UNRESOLVED: u8 = 0;
/// A producer won the transition race and is writing the payload.
const CLAIMED: u8 = 1;
/// The payload is a concrete value.
const CONCRETE: u8 = 2;
/// The payload is an error diagnostic.
const ERROR: u8 = 3;
/// The payload is a link to the value this one forwards to.
const LINKED: u8 = 4;

enum Payload {
    Empty,
    Concrete(Box<dyn Any + Send + Sync>),
    Error(Box<Diagnostic>),
    Link(Ref<AsyncValue>),
}

type BoxedWaiter = Box<dyn FnOnce() + Send>;

/// One queued continuation. Nodes form an intrusive LIFO stack.
struct WaiterNode {
    next: *mut WaiterNode,
    waiter: Option<BoxedWaiter>,
}

/// Marker stored in the stack head once the value has resolved (or linked)
/// and the stack has been drained. Never dereferenced.
fn sealed() -> *mut WaiterNode {
    static SEALED: u8 = 0;
    &SEALED as *const u8 as *mut WaiterNode
}

/// A reference-counted, set-once future holding a value, an error, or a
/// forwarding link. Constructed through [`crate::HostContext`], which
/// allocates it from its own allocator and stamps it with the owning
/// context's index so destruction can free it through the same allocator.
pub struct AsyncValue {
    state: AtomicU8,
    indirect: bool,
    owner: HostId,
    refs: AtomicUsize,
    waiters: AtomicPtr<WaiterNode>,
    payload: UnsafeCell<Payload>,
}

// The payload is written exactly once, by the thread that claimed the
// state transition, before the release store that publishes the resolved
// state; afterwards it is read-only. Boxed payloads are Send + Sync.
unsafe impl Send for AsyncValue {}
unsafe impl Sync for AsyncValue {}

impl AsyncValue {
    pub(crate) fn unresolved(owner: HostId) -> Self {
        Self {
            state: AtomicU8::new(UNRESOLVED),
            indirect: false,
            owner,
            refs: AtomicUsize::new(1),
            waiters: AtomicPtr::new(ptr::null_mut()),
            payload: UnsafeCell::new(Payload::Empty),
        }
    }

    pub(crate) fn available(owner: HostId, value: Box<dyn Any + Send + Sync>) -> Self {
        Self {
            state: AtomicU8::new(CONCRETE),
            indirect: false,
            owner,
            refs: AtomicUsize::new(1),
            waiters: AtomicPtr::new(sealed()),
            payload: UnsafeCell::new(Payload::Concrete(value)),
        }
    }

    pub(crate) fn new_error(owner: HostId, diagnostic: Diagnostic) -> Self {
        Self {
            state: AtomicU8::new(ERROR),
            indirect: false,
            owner,
            refs: AtomicUsize::new(1),
            waiters: AtomicPtr::new(sealed()),
            payload: UnsafeCell::new(Payload::Error(Box::new(diagnostic))),
        }
    }

    pub(crate) fn indirect(owner: HostId) -> Self {
        Self {
            state: AtomicU8::new(UNRESOLVED),
            indirect: true,
            owner,
            refs: AtomicUsize::new(1),
            waiters: AtomicPtr::new(ptr::null_mut()),
            payload: UnsafeCell::new(Payload::Empty),
        }
    }

    fn state_of(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    /// Follow forwarding links to the value that holds the actual state.
    fn representative(&self) -> &AsyncValue {
        let mut current = self;
        while current.state_of() == LINKED {
            current = current.link_target();
        }
        current
    }

    /// The link payload. Only valid after observing `LINKED` with acquire
    /// ordering; the link is immutable once published.
    fn link_target(&self) -> &AsyncValue {
        match unsafe { &*self.payload.get() } {
            Payload::Link(target) => target,
            _ => unreachable!("linked state without link payload"),
        }
    }

    /// Whether the value resolved to either a concrete payload or an error.
    pub fn is_available(&self) -> bool {
        matches!(self.representative().state_of(), CONCRETE | ERROR)
    }

    /// Whether the value is still pending.
    pub fn is_unavailable(&self) -> bool {
        !self.is_available()
    }

    /// Whether the value resolved to a concrete payload.
    pub fn is_concrete(&self) -> bool {
        self.representative().state_of() == CONCRETE
    }

    /// Whether the value resolved to an error.
    pub fn is_error(&self) -> bool {
        self.representative().state_of() == ERROR
    }

    /// Whether this handle is the only reference to the value.
    pub fn is_unique(&self) -> bool {
        self.refs.load(Ordering::Acquire) == 1
    }

    /// Borrow the concrete payload.
    ///
    /// # Panics
    ///
    /// Panics if the value is not concrete, or if `T` is not the payload
    /// type it was resolved with. Reading before resolution is a
    /// programming error.
    pub fn get<T: 'static>(&self) -> &T {
        let representative = self.representative();
        assert_eq!(
            representative.state_of(),
            CONCRETE,
            "async value read before it was set"
        );
        match unsafe { &*representative.payload.get() } {
            Payload::Concrete(value) => value
                .downcast_ref::<T>()
                .expect("async value payload type mismatch"),
            _ => unreachable!("concrete state without concrete payload"),
        }
    }

    /// Borrow the error diagnostic.
    ///
    /// # Panics
    ///
    /// Panics if the value is not in the error state.
    pub fn error(&self) -> &Diagnostic {
        self.error_if_present()
            .expect("async value is not in the error state")
    }

    /// The error diagnostic, if the value resolved to one.
    pub fn error_if_present(&self) -> Option<&Diagnostic> {
        let representative = self.representative();
        if representative.state_of() != ERROR {
            return None;
        }
        match unsafe { &*representative.payload.get() } {
            Payload::Error(diagnostic) => Some(diagnostic),
            _ => unreachable!("error state without error payload"),
        }
    }

    /// Resolve to a concrete payload, waking every waiter.
    ///
    /// Fails with [`Error::Invariant`] if the value already resolved or is
    /// an indirect value (those resolve through [`AsyncValue::forward_to`]).
    pub(crate) fn set_concrete_boxed(&self, value: Box<dyn Any + Send + Sync>) -> Result<()> {
        if self.indirect {
            return Err(Error::invariant(
                "indirect async values resolve through forward_to",
            ));
        }
        self.claim()?;
        self.publish(Payload::Concrete(value), CONCRETE);
        Ok(())
    }

    /// Resolve to an error, waking every waiter.
    pub fn set_error(&self, diagnostic: Diagnostic) -> Result<()> {
        if self.indirect {
            return Err(Error::invariant(
                "indirect async values resolve through forward_to",
            ));
        }
        self.claim()?;
        self.publish(Payload::Error(Box::new(diagnostic)), ERROR);
        Ok(())
    }

    /// Adopt the state of `target` once it resolves. Only indirect values
    /// forward, and only once; observers of this value transparently see
    /// the final resolution at the end of the chain.
    pub fn forward_to(&self, target: Ref<AsyncValue>) -> Result<()> {
        if !self.indirect {
            return Err(Error::invariant("only indirect async values can forward"));
        }
        // Collapse eagerly: link to the chain's representative so lookups
        // stay short no matter how the chain was built.
        let target = representative_ref(target);
        debug_assert!(
            !ptr::eq(&*target, self),
            "async value forwarded to itself"
        );
        self.claim()?;
        unsafe {
            *self.payload.get() = Payload::Link(target.clone());
        }
        self.state.store(LINKED, Ordering::Release);

        // Hand queued waiters to the representative; they fire when it
        // resolves (immediately, if it already has).
        let mut head = self.waiters.swap(sealed(), Ordering::AcqRel);
        while !head.is_null() && head != sealed() {
            let mut node = unsafe { Box::from_raw(head) };
            head = node.next;
            if let Some(waiter) = node.waiter.take() {
                target.and_then_boxed(waiter);
            }
        }
        Ok(())
    }

    /// Run `waiter` once the value resolves. If it already has, the waiter
    /// runs synchronously on the calling thread.
    pub fn and_then<F>(&self, waiter: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.and_then_boxed(Box::new(waiter));
    }

    pub(crate) fn and_then_boxed(&self, waiter: BoxedWaiter) {
        let mut waiter = waiter;
        let mut current = self;
        loop {
            match current.state_of() {
                CONCRETE | ERROR => {
                    waiter();
                    return;
                }
                LINKED => {
                    current = current.link_target();
                    continue;
                }
                _ => {}
            }
            match current.try_push_waiter(waiter) {
                Ok(()) => return,
                // The stack was sealed between the state probe and the
                // push; re-dispatch against the new state.
                Err(rejected) => waiter = rejected,
            }
        }
    }

    fn try_push_waiter(&self, waiter: BoxedWaiter) -> std::result::Result<(), BoxedWaiter> {
        let mut node = Box::new(WaiterNode {
            next: ptr::null_mut(),
            waiter: Some(waiter),
        });
        let mut head = self.waiters.load(Ordering::Acquire);
        loop {
            if head == sealed() {
                return Err(node.waiter.take().expect("waiter still queued"));
            }
            node.next = head;
            let raw = Box::into_raw(node);
            match self.waiters.compare_exchange_weak(
                head,
                raw,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => {
                    node = unsafe { Box::from_raw(raw) };
                    head = observed;
                }
            }
        }
    }

    /// Win the right to resolve. The single compare-exchange on the state
    /// word; losers observe a state other than `UNRESOLVED`.
    fn claim(&self) -> Result<()> {
        self.state
            .compare_exchange(UNRESOLVED, CLAIMED, Ordering::Acquire, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| Error::invariant("async value resolved more than once"))
    }

    fn publish(&self, payload: Payload, state: u8) {
        unsafe {
            *self.payload.get() = payload;
        }
        self.state.store(state, Ordering::Release);
        self.flush_waiters();
    }

    /// Detach the waiter stack and run every waiter in LIFO order. A
    /// panicking waiter must not silence the rest; the panic is reported
    /// through the owning context's diagnostic sink instead.
    fn flush_waiters(&self) {
        let mut head = self.waiters.swap(sealed(), Ordering::AcqRel);
        while !head.is_null() && head != sealed() {
            let mut node = unsafe { Box::from_raw(head) };
            head = node.next;
            if let Some(waiter) = node.waiter.take() {
                if let Err(cause) = panic::catch_unwind(AssertUnwindSafe(waiter)) {
                    host::report_waiter_panic(self.owner, cause.as_ref());
                }
            }
        }
    }
}

/// Follow links on an owned handle, returning the chain's representative.
fn representative_ref(value: Ref<AsyncValue>) -> Ref<AsyncValue> {
    let mut current = value;
    loop {
        if current.state_of() != LINKED {
            return current;
        }
        let next = match unsafe { &*current.payload.get() } {
            Payload::Link(target) => target.clone(),
            _ => unreachable!("linked state without link payload"),
        };
        current = next;
    }
}

impl RefCounted for AsyncValue {
    fn ref_count(&self) -> &AtomicUsize {
        &self.refs
    }

    unsafe fn destroy(this: NonNull<Self>) {
        let owner = this.as_ref().owner;
        ptr::drop_in_place(this.as_ptr());
        host::deallocate_value(owner, this.cast());
    }
}

impl Drop for AsyncValue {
    fn drop(&mut self) {
        // Waiters registered on a value that dies unresolved never run;
        // their nodes still have to be freed.
        let mut head = *self.waiters.get_mut();
        while !head.is_null() && head != sealed() {
            let node = unsafe { Box::from_raw(head) };
            head = node.next;
        }
    }
}
