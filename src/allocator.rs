//! Host memory allocation.
//!
//! The host context routes every allocation through a [`HostAllocator`] so
//! embedders can substitute arena, pool, or instrumented allocators without
//! touching the rest of the runtime. Allocation failure is fatal by
//! contract; implementations abort instead of returning null.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Sized, aligned allocation interface shared by a host context and every
/// async value it creates. Implementations must be thread-safe.
pub trait HostAllocator: Send + Sync {
    /// Allocate `size` bytes aligned to `align` (a power of two).
    fn allocate(&self, size: usize, align: usize) -> NonNull<u8>;

    /// Release an allocation made by this allocator. `size` and `align`
    /// must match the original request; Rust deallocation needs both.
    fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: usize);
}

/// The process allocator, straight through `std::alloc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAllocator;

impl HostAllocator for SystemAllocator {
    fn allocate(&self, size: usize, align: usize) -> NonNull<u8> {
        debug_assert!(size > 0, "zero-sized host allocation");
        let layout = Layout::from_size_align(size, align).expect("invalid allocation layout");
        let ptr = unsafe { alloc::alloc(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        }
    }

    fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        let layout = Layout::from_size_align(size, align).expect("invalid allocation layout");
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// Counters maintained by [`TrackingAllocator`].
#[derive(Debug, Default)]
pub struct AllocatorStats {
    /// Total allocations served.
    pub allocations: AtomicUsize,
    /// Total deallocations served.
    pub deallocations: AtomicUsize,
    /// Total bytes handed out over the allocator's lifetime.
    pub bytes_allocated: AtomicUsize,
}

impl AllocatorStats {
    /// Allocations that have not been freed yet.
    pub fn live_allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed) - self.deallocations.load(Ordering::Relaxed)
    }
}

/// Decorator that counts traffic through an inner allocator. Useful for
/// leak assertions in tests and for sizing reports.
pub struct TrackingAllocator {
    inner: Box<dyn HostAllocator>,
    stats: Arc<AllocatorStats>,
}

impl TrackingAllocator {
    /// Track the system allocator.
    pub fn new() -> Self {
        Self::wrapping(Box::new(SystemAllocator))
    }

    /// Track an arbitrary inner allocator.
    pub fn wrapping(inner: Box<dyn HostAllocator>) -> Self {
        Self {
            inner,
            stats: Arc::new(AllocatorStats::default()),
        }
    }

    /// A handle to the counters that stays valid after the allocator moves
    /// into a host context.
    pub fn stats(&self) -> Arc<AllocatorStats> {
        Arc::clone(&self.stats)
    }
}

impl Default for TrackingAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HostAllocator for TrackingAllocator {
    fn allocate(&self, size: usize, align: usize) -> NonNull<u8> {
        let ptr = self.inner.allocate(size, align);
        self.stats.allocations.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_allocated.fetch_add(size, Ordering::Relaxed);
        ptr
    }

    fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        self.inner.deallocate(ptr, size, align);
        self.stats.deallocations.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_allocator_round_trip() {
        let allocator = SystemAllocator;
        let ptr = allocator.allocate(64, 16);
        assert_eq!(ptr.as_ptr() as usize % 16, 0);

        unsafe {
            ptr.as_ptr().write_bytes(0xAB, 64);
            assert_eq!(*ptr.as_ptr(), 0xAB);
        }
        allocator.deallocate(ptr, 64, 16);
    }

    #[test]
    fn test_tracking_allocator_counts_traffic() {
        let allocator = TrackingAllocator::new();
        let stats = allocator.stats();

        let first = allocator.allocate(32, 8);
        let second = allocator.allocate(128, 64);
        assert_eq!(stats.allocations.load(Ordering::Relaxed), 2);
        assert_eq!(stats.bytes_allocated.load(Ordering::Relaxed), 160);
        assert_eq!(stats.live_allocations(), 2);

        allocator.deallocate(first, 32, 8);
        allocator.deallocate(second, 128, 64);
        assert_eq!(stats.live_allocations(), 0);
    }
}
