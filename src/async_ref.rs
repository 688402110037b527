//! Typed view over the erased [`AsyncValue`] cell.
//!
//! [`AsyncValueRef<T>`] carries the payload type in a phantom parameter so
//! call sites do not restate it at every `get`/`emplace`. It owns one
//! reference on the underlying value, exactly like the erased handle it
//! wraps.

use std::fmt;
use std::marker::PhantomData;

use crate::async_value::AsyncValue;
use crate::diagnostic::Diagnostic;
use crate::error::Result;
use crate::refcount::Ref;

/// Payload of the always-ready sentinel. Carries no data; its only job is
/// to signal that a dependency chain has completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Chain;

/// One counted reference to an [`AsyncValue`] whose payload is known to be
/// `T`.
pub struct AsyncValueRef<T> {
    value: Ref<AsyncValue>,
    _payload: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> AsyncValueRef<T> {
    pub(crate) fn new(value: Ref<AsyncValue>) -> Self {
        Self {
            value,
            _payload: PhantomData,
        }
    }

    /// Whether the value resolved to either a payload or an error.
    pub fn is_available(&self) -> bool {
        self.value.is_available()
    }

    /// Whether the value resolved to a concrete payload.
    pub fn is_concrete(&self) -> bool {
        self.value.is_concrete()
    }

    /// Whether the value resolved to an error.
    pub fn is_error(&self) -> bool {
        self.value.is_error()
    }

    /// Borrow the payload. Panics unless [`AsyncValueRef::is_concrete`].
    pub fn get(&self) -> &T {
        self.value.get::<T>()
    }

    /// Construct the payload in place and resolve the value.
    pub fn emplace(&self, value: T) -> Result<()> {
        self.value.set_concrete_boxed(Box::new(value))
    }

    /// Resolve the value to an error.
    pub fn set_error(&self, diagnostic: impl Into<Diagnostic>) -> Result<()> {
        self.value.set_error(diagnostic.into())
    }

    /// Borrow the error diagnostic. Panics unless [`AsyncValueRef::is_error`].
    pub fn error(&self) -> &Diagnostic {
        self.value.error()
    }

    /// Run `waiter` once the value resolves; synchronously if it already
    /// has.
    pub fn and_then<F>(&self, waiter: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.value.and_then(waiter);
    }

    /// The erased value this handle wraps.
    pub fn as_value(&self) -> &AsyncValue {
        &self.value
    }

    /// A new counted reference to the erased value.
    pub fn value_ref(&self) -> Ref<AsyncValue> {
        self.value.clone()
    }

    /// Give up the typed view, keeping the counted reference.
    pub fn release(self) -> Ref<AsyncValue> {
        self.value
    }
}

impl<T> Clone for AsyncValueRef<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T> From<AsyncValueRef<T>> for Ref<AsyncValue> {
    fn from(reference: AsyncValueRef<T>) -> Self {
        reference.value
    }
}

impl<T> fmt::Debug for AsyncValueRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncValueRef")
            .field("available", &self.value.is_available())
            .field("error", &self.value.is_error())
            .finish()
    }
}
