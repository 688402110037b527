//! Host context behavior: join synchronization, cancellation, shared
//! contexts, and teardown accounting.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use flowhost::{
    HostContext, SharedContext, ThreadWorkQueue, TrackingAllocator, WorkQueueConfig,
};

fn small_queue() -> ThreadWorkQueue {
    ThreadWorkQueue::new(WorkQueueConfig {
        worker_threads: 4,
        blocking_threads: 2,
        blocking_queue_capacity: 32,
    })
}

fn quiet_host() -> HostContext {
    HostContext::new(
        Box::new(|_| {}),
        Box::new(flowhost::SystemAllocator),
        Box::new(small_queue()),
    )
}

#[test]
fn test_run_when_ready_fires_once_after_last_input() {
    let host = quiet_host();
    let x = host.make_unconstructed_async_value::<u32>();
    let y = host.make_unconstructed_async_value::<u32>();
    let z = host.make_unconstructed_async_value::<u32>();

    let fired = Arc::new(AtomicUsize::new(0));
    let observer = Arc::clone(&fired);
    host.run_when_ready(
        &[x.value_ref(), y.value_ref(), z.value_ref()],
        move || {
            observer.fetch_add(1, Ordering::Relaxed);
        },
    );

    // Resolve on three distinct threads, z first, y last.
    let resolver = {
        let z = z.clone();
        thread::spawn(move || z.emplace(3).unwrap())
    };
    resolver.join().unwrap();
    assert_eq!(fired.load(Ordering::Relaxed), 0);

    let resolver = {
        let x = x.clone();
        thread::spawn(move || x.emplace(1).unwrap())
    };
    resolver.join().unwrap();
    assert_eq!(fired.load(Ordering::Relaxed), 0);

    let resolver = {
        let y = y.clone();
        thread::spawn(move || y.emplace(2).unwrap())
    };
    resolver.join().unwrap();
    assert_eq!(fired.load(Ordering::Relaxed), 1);
}

#[test]
fn test_run_when_ready_does_not_short_circuit_on_error_inputs() {
    let host = quiet_host();
    let failed = host.make_error_async_value("upstream failed");
    let pending = host.make_unconstructed_async_value::<u32>();

    let fired = Arc::new(AtomicUsize::new(0));
    let observer = Arc::clone(&fired);
    host.run_when_ready(&[failed.clone(), pending.value_ref()], move || {
        observer.fetch_add(1, Ordering::Relaxed);
    });

    // The error input is resolved, not a trigger; the join still waits
    // for the pending input.
    assert_eq!(fired.load(Ordering::Relaxed), 0);
    pending.emplace(1).unwrap();
    assert_eq!(fired.load(Ordering::Relaxed), 1);
    assert!(failed.is_error());
}

#[test]
fn test_run_when_ready_with_all_errors_runs_inline() {
    let host = quiet_host();
    let first = host.make_error_async_value("a");
    let second = host.make_error_async_value("b");

    let fired = Arc::new(AtomicUsize::new(0));
    let observer = Arc::clone(&fired);
    host.run_when_ready(&[first, second], move || {
        observer.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(fired.load(Ordering::Relaxed), 1);
}

#[test]
fn test_concurrent_cancel_retains_exactly_one_value() {
    let allocator = TrackingAllocator::new();
    let stats = allocator.stats();
    let host = HostContext::new(Box::new(|_| {}), Box::new(allocator), Box::new(small_queue()));

    let baseline = stats.live_allocations();

    thread::scope(|scope| {
        let first = &host;
        let second = &host;
        scope.spawn(move || first.cancel_execution("A"));
        scope.spawn(move || second.cancel_execution("B"));
    });

    let cancel = host.cancel_value().expect("one cancel value installed");
    let message = cancel.error().message.clone();
    assert!(message == "A" || message == "B", "unexpected winner {message}");
    drop(cancel);

    // The losing error future dropped to refcount zero and was freed:
    // only the installed winner remains allocated.
    assert_eq!(stats.live_allocations(), baseline + 1);

    host.restart();
    assert!(host.cancel_value().is_none());
    assert_eq!(stats.live_allocations(), baseline);
}

#[test]
fn test_cancel_restart_cycle_repeats() {
    let host = quiet_host();

    host.cancel_execution("first run");
    assert_eq!(
        host.cancel_value().unwrap().error().message,
        "first run"
    );

    host.restart();
    assert!(host.cancel_value().is_none());

    host.cancel_execution("second run");
    assert_eq!(
        host.cancel_value().unwrap().error().message,
        "second run"
    );
}

struct CountingService {
    id: usize,
}

impl SharedContext for CountingService {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[test]
fn test_shared_context_factory_runs_once_across_threads() {
    let host = quiet_host();
    let factory_runs = Arc::new(AtomicUsize::new(0));

    let mut addresses = Vec::new();
    thread::scope(|scope| {
        let mut handles = Vec::new();
        for _ in 0..64 {
            let host = &host;
            let factory_runs = Arc::clone(&factory_runs);
            handles.push(scope.spawn(move || {
                let service = host.get_or_create_shared(5, move |_| {
                    let id = factory_runs.fetch_add(1, Ordering::Relaxed);
                    Box::new(CountingService { id })
                });
                service as *const dyn SharedContext as *const () as usize
            }));
        }
        for handle in handles {
            addresses.push(handle.join().unwrap());
        }
    });

    assert_eq!(factory_runs.load(Ordering::Relaxed), 1);
    assert!(addresses.windows(2).all(|pair| pair[0] == pair[1]));

    let service = host.get_or_create_shared(5, |_| unreachable!("slot already initialized"));
    let service = service
        .as_any()
        .downcast_ref::<CountingService>()
        .expect("slot holds the counting service");
    assert_eq!(service.id, 0);
}

#[test]
fn test_emit_error_reaches_the_sink() {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let captured = Arc::clone(&seen);
    let host = HostContext::new(
        Box::new(move |diagnostic| captured.lock().push(diagnostic.message.clone())),
        Box::new(flowhost::SystemAllocator),
        Box::new(small_queue()),
    );

    host.emit_error(flowhost::Diagnostic::new("shape mismatch in matmul"));
    assert_eq!(seen.lock().as_slice(), &["shape mismatch in matmul"]);
}

#[test]
fn test_await_values_blocks_until_pool_resolves() {
    let host = quiet_host();
    let value = host.make_unconstructed_async_value::<u64>();

    let producer = value.clone();
    host.enqueue_work(move || {
        // Simulate a kernel that takes a moment to produce.
        thread::sleep(std::time::Duration::from_millis(20));
        producer.emplace(99).unwrap();
    });

    host.await_values(&[value.value_ref()]);
    assert!(value.is_concrete());
    assert_eq!(*value.get(), 99);
}

#[test]
fn test_teardown_frees_every_cell_it_allocated() {
    let allocator = TrackingAllocator::new();
    let stats = allocator.stats();
    let host = HostContext::new(Box::new(|_| {}), Box::new(allocator), Box::new(small_queue()));

    let a = host.make_available_async_value(1u32);
    let b = host.make_unconstructed_async_value::<u32>();
    let c = host.make_indirect_async_value();
    c.forward_to(a.value_ref()).unwrap();
    host.cancel_execution("wind down");

    drop(a);
    drop(b);
    drop(c);
    drop(host);

    // Ready chain, cancel value, and every cell came back.
    assert_eq!(stats.live_allocations(), 0);
}
