//! Shared contexts: lazily constructed per-host singletons.
//!
//! Services that need one instance per host context (a kernel cache, a
//! tensor layout pool, a tracing bridge) register a shared-context type
//! and fetch it through the host. Slots are addressed by a dense integer
//! id assigned once per type from a process-global counter; the first
//! caller through a slot's one-shot guard runs the factory, everyone else
//! blocks until the instance is stored and then borrows it for the life of
//! the host context.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::RwLock;

use crate::host::HostContext;

/// Fixed capacity of the per-context shared-context registry.
pub const MAX_SHARED_CONTEXTS: usize = 256;

/// A per-host singleton service.
pub trait SharedContext: Send + Sync {
    /// Downcast hook so typed accessors can recover the concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// Shared contexts that know how to build themselves from a host context.
/// Implementing this enables [`HostContext::shared_context`].
pub trait SharedContextType: SharedContext + Sized + 'static {
    fn create(host: &HostContext) -> Self;
}

/// Count of distinct shared-context types registered in this process.
static NUM_SHARED_CONTEXT_TYPES: AtomicUsize = AtomicUsize::new(0);

static SHARED_CONTEXT_IDS: Lazy<RwLock<HashMap<TypeId, usize>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// The dense id for `T`, assigned on first use and stable for the life of
/// the process.
///
/// # Panics
///
/// Panics if more than [`MAX_SHARED_CONTEXTS`] types are registered.
pub fn shared_context_id<T: 'static>() -> usize {
    let type_id = TypeId::of::<T>();
    if let Some(&id) = SHARED_CONTEXT_IDS.read().get(&type_id) {
        return id;
    }
    let mut ids = SHARED_CONTEXT_IDS.write();
    *ids.entry(type_id).or_insert_with(|| {
        let id = NUM_SHARED_CONTEXT_TYPES.fetch_add(1, Ordering::Relaxed);
        assert!(
            id < MAX_SHARED_CONTEXTS,
            "too many shared context types (limit {MAX_SHARED_CONTEXTS})"
        );
        id
    })
}

/// The per-context slot array. One-shot initialization per slot; after
/// init the instance is read-only and stable.
pub(crate) struct SharedContextManager {
    slots: Box<[OnceCell<Box<dyn SharedContext>>]>,
}

impl SharedContextManager {
    pub(crate) fn new() -> Self {
        let slots: Vec<OnceCell<Box<dyn SharedContext>>> =
            (0..MAX_SHARED_CONTEXTS).map(|_| OnceCell::new()).collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    pub(crate) fn get_or_create<'a>(
        &'a self,
        host: &HostContext,
        id: usize,
        factory: impl FnOnce(&HostContext) -> Box<dyn SharedContext>,
    ) -> &'a dyn SharedContext {
        assert!(
            id < MAX_SHARED_CONTEXTS,
            "shared context id {id} exceeds the maximum allowed"
        );
        self.slots[id].get_or_init(|| factory(host)).as_ref()
    }
}
