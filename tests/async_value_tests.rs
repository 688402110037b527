//! Behavioral tests for async value resolution, continuation chaining,
//! and indirect forwarding.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use flowhost::{Error, HostContext};

#[test]
fn test_available_value_round_trip() {
    let host = HostContext::new_default();
    let value = host.make_available_async_value(42u64);
    assert!(value.is_concrete());
    assert_eq!(*value.get(), 42);
}

#[test]
fn test_emplace_then_get() {
    let host = HostContext::new_default();
    let value = host.make_unconstructed_async_value::<Vec<u8>>();
    assert!(!value.is_available());

    value.emplace(vec![1, 2, 3]).unwrap();
    assert!(value.is_concrete());
    assert_eq!(value.get().as_slice(), &[1, 2, 3]);
}

#[test]
fn test_value_resolves_at_most_once() {
    let host = HostContext::new_default();
    let value = host.make_unconstructed_async_value::<u32>();

    value.emplace(1).unwrap();
    assert!(matches!(value.emplace(2), Err(Error::Invariant { .. })));
    assert!(matches!(
        value.set_error("late failure"),
        Err(Error::Invariant { .. })
    ));
    assert_eq!(*value.get(), 1);
}

#[test]
fn test_waiters_fire_exactly_once_under_contention() {
    let host = HostContext::new_default();
    let value = host.make_unconstructed_async_value::<u32>();
    let fired = Arc::new(AtomicUsize::new(0));

    const REGISTRARS: usize = 8;
    const WAITERS_EACH: usize = 100;

    thread::scope(|scope| {
        for _ in 0..REGISTRARS {
            let value = value.clone();
            let fired = Arc::clone(&fired);
            scope.spawn(move || {
                for _ in 0..WAITERS_EACH {
                    let fired = Arc::clone(&fired);
                    value.and_then(move || {
                        fired.fetch_add(1, Ordering::Relaxed);
                    });
                }
            });
        }
        let value = value.clone();
        scope.spawn(move || {
            value.emplace(7).unwrap();
        });
    });

    // Whether a waiter was queued before resolution or ran inline after
    // it, each runs exactly once.
    assert_eq!(fired.load(Ordering::Relaxed), REGISTRARS * WAITERS_EACH);
}

#[test]
fn test_waiter_after_resolution_runs_on_registering_thread() {
    let host = HostContext::new_default();
    let value = host.make_unconstructed_async_value::<u32>();
    value.emplace(5).unwrap();

    let registering_thread = thread::current().id();
    let observed = Arc::new(parking_lot::Mutex::new(None));
    let slot = Arc::clone(&observed);
    value.and_then(move || {
        *slot.lock() = Some(thread::current().id());
    });

    assert_eq!(*observed.lock(), Some(registering_thread));
}

#[test]
fn test_indirect_forward_to_available_value() {
    let host = HostContext::new_default();

    let indirect = host.make_indirect_async_value();
    assert!(!indirect.is_available());

    let concrete = host.make_available_async_value(42u32);
    indirect.forward_to(concrete.value_ref()).unwrap();

    assert!(indirect.is_available());
    assert!(indirect.is_concrete());
    assert_eq!(*indirect.get::<u32>(), 42);
}

#[test]
fn test_waiter_on_indirect_fires_once_after_forward() {
    let host = HostContext::new_default();
    let indirect = host.make_indirect_async_value();

    let fired = Arc::new(AtomicUsize::new(0));
    let observer = Arc::clone(&fired);
    indirect.and_then(move || {
        observer.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(fired.load(Ordering::Relaxed), 0);

    indirect
        .forward_to(host.make_available_async_value(7u32).release())
        .unwrap();
    assert_eq!(fired.load(Ordering::Relaxed), 1);
}

#[test]
fn test_forward_to_pending_value_adopts_later_resolution() {
    let host = HostContext::new_default();
    let indirect = host.make_indirect_async_value();
    let producer = host.make_unconstructed_async_value::<String>();

    indirect.forward_to(producer.value_ref()).unwrap();
    assert!(!indirect.is_available());

    let fired = Arc::new(AtomicUsize::new(0));
    let observer = Arc::clone(&fired);
    indirect.and_then(move || {
        observer.fetch_add(1, Ordering::Relaxed);
    });

    producer.emplace("late".to_string()).unwrap();
    assert!(indirect.is_concrete());
    assert_eq!(indirect.get::<String>(), "late");
    assert_eq!(fired.load(Ordering::Relaxed), 1);
}

#[test]
fn test_indirect_chain_collapses_to_error() {
    let host = HostContext::new_default();

    // outer -> inner -> (later) error: every link in the chain reports
    // the final resolution.
    let outer = host.make_indirect_async_value();
    let inner = host.make_indirect_async_value();
    outer.forward_to(inner.clone()).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let observer = Arc::clone(&fired);
    outer.and_then(move || {
        observer.fetch_add(1, Ordering::Relaxed);
    });

    inner
        .forward_to(host.make_error_async_value("downstream failed"))
        .unwrap();

    assert!(inner.is_error());
    assert!(outer.is_error());
    assert_eq!(outer.error().message, "downstream failed");
    assert_eq!(fired.load(Ordering::Relaxed), 1);
}

#[test]
fn test_indirect_cannot_forward_twice() {
    let host = HostContext::new_default();
    let indirect = host.make_indirect_async_value();

    indirect
        .forward_to(host.make_available_async_value(1u32).release())
        .unwrap();
    let second = indirect.forward_to(host.make_available_async_value(2u32).release());
    assert!(matches!(second, Err(Error::Invariant { .. })));
    assert_eq!(*indirect.get::<u32>(), 1);
}

#[test]
fn test_concrete_value_cannot_forward() {
    let host = HostContext::new_default();
    let value = host.make_available_async_value(1u32);
    let target = host.make_available_async_value(2u32);

    let result = value.as_value().forward_to(target.value_ref());
    assert!(matches!(result, Err(Error::Invariant { .. })));
}

#[test]
fn test_error_propagates_to_waiters_like_a_value() {
    let host = HostContext::new_default();
    let value = host.make_unconstructed_async_value::<u32>();

    let fired = Arc::new(AtomicUsize::new(0));
    let observer = Arc::clone(&fired);
    value.and_then(move || {
        observer.fetch_add(1, Ordering::Relaxed);
    });

    value.set_error("kernel trap").unwrap();
    assert!(value.is_error());
    assert_eq!(value.error().message, "kernel trap");
    assert_eq!(fired.load(Ordering::Relaxed), 1);
}
