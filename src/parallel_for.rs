//! Parallel-for block scheduling.
//!
//! The index range `[0, n)` is cut into blocks and fanned out through the
//! work queue by recursive bisection: the caller repeatedly enqueues the
//! upper half of its block range and keeps the lower half, so submission
//! costs O(log blocks) on the caller and the blocks spread through the
//! pool in tree order. The caller thread computes one block itself.

use std::cmp;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::host::{HostContext, HostState};
use crate::work_queue::TaskFunction;

/// Cap on blocks per worker: never cut `n` into more than
/// `MAX_OVERSHARDING * parallelism` blocks.
const MAX_OVERSHARDING: usize = 4;

type ComputeFn = Box<dyn Fn(usize, usize) + Send + Sync>;
type DoneFn = Box<dyn FnOnce() + Send>;

/// Heap-resident state for one parallel-for execution. Kept alive by the
/// enqueued block tasks; the final decrement of `pending_blocks` runs
/// `on_done` and lets the last `Arc` free it.
struct ParallelForContext {
    state: Arc<HostState>,
    total: usize,
    block_size: usize,
    pending_blocks: AtomicUsize,
    compute: ComputeFn,
    on_done: Mutex<Option<DoneFn>>,
}

pub(crate) fn parallel_for(
    host: &HostContext,
    total: usize,
    compute: ComputeFn,
    on_done: DoneFn,
    min_block_size: usize,
) {
    assert!(min_block_size >= 1, "illegal min block size");

    let parallelism = host.parallelism_level() as usize;
    let block_size = cmp::max(min_block_size, total / (MAX_OVERSHARDING * parallelism));

    // One block: run everything on the caller, no heap context.
    if total <= block_size {
        compute(0, total);
        on_done();
        return;
    }

    let blocks = div_up(total, block_size);
    let context = Arc::new(ParallelForContext {
        state: host.state_arc(),
        total,
        block_size,
        pending_blocks: AtomicUsize::new(blocks),
        compute,
        on_done: Mutex::new(Some(on_done)),
    });
    eval_blocks(&context, 0, blocks);
}

fn eval_blocks(context: &Arc<ParallelForContext>, start_block: usize, end_block: usize) {
    let mut start_block = start_block;
    let mut end_block = end_block;
    while end_block - start_block > 1 {
        let mid_block = start_block + (end_block - start_block) / 2;

        // Fan [mid, end) out through the pool; keep [start, mid).
        let child = Arc::clone(context);
        context.state.enqueue(TaskFunction::new(move || {
            eval_blocks(&child, mid_block, end_block);
        }));
        end_block = mid_block;
    }

    debug_assert_eq!(end_block - start_block, 1);

    let lo = start_block * context.block_size;
    let hi = cmp::min(context.total, end_block * context.block_size);
    (context.compute)(lo, hi);

    // The thread that retires the last block signals completion.
    if context.pending_blocks.fetch_sub(1, Ordering::AcqRel) == 1 {
        if let Some(on_done) = context.on_done.lock().take() {
            on_done();
        }
    }
}

fn div_up(x: usize, y: usize) -> usize {
    debug_assert!(y > 0);
    (x + y - 1) / y
}
