//! TLB shootdown coordination
//!
//! When a VM block is freed, its page-table entries are detached at once,
//! but a thread on another CPU may still hold the stale translation in its
//! TLB. Reusing the physical frames before every CPU has invalidated that
//! entry would let an unrelated allocation alias a still-cached mapping,
//! a correctness and security hazard. So reclamation is gated on a
//! per-request acknowledgement countdown:
//!
//! 1. The initiator allocates a global sequence number, detaches the
//!    translations, and registers a request whose counter starts at the
//!    online CPU count.
//! 2. Every CPU acknowledges at its next syscall-dispatch entry
//!    ([`service_local`]): flush the local TLB range, decrement.
//! 3. The final acknowledgement fires the completion hook, which frees the
//!    captured frames and merges the block back into the owner's free
//!    list.
//!
//! The countdown is the one cross-CPU consistency point in the kernel not
//! mediated by a single lock; it is effectively a distributed barrier
//! scoped to one reclamation event.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use spin::Once;

use crate::collections::List;
use crate::hal::{self, PhysAddr, VirtAddr};
use crate::metrics::METRICS;
use crate::sync::IrqSpinLock;
use crate::task::ProcessId;
use crate::tlb_log;

/// An in-flight shootdown
pub struct ShootdownRequest {
    pub seq: u64,
    pub owner: ProcessId,
    pub base: VirtAddr,
    pub pages: usize,
    /// Captured backing frames, `kmalloc`-owned array released by the
    /// completion hook. Null when the block did not own its frames.
    pub frames: *mut PhysAddr,
    pub frame_count: usize,
    /// Outstanding acknowledgements
    acks: AtomicUsize,
    /// Bit per CPU that has flushed
    cpu_mask: AtomicUsize,
}

// Safety: the frames array is owned by the request and handed to exactly
// one completion call.
unsafe impl Send for ShootdownRequest {}

/// Everything the completion hook needs to finish a reclamation
pub struct CompletedShootdown {
    pub seq: u64,
    pub owner: ProcessId,
    pub base: VirtAddr,
    pub pages: usize,
    pub frames: *mut PhysAddr,
    pub frame_count: usize,
}

/// Completion hook; installed once by the task layer
type CompletionFn = fn(CompletedShootdown);

static PENDING: IrqSpinLock<List<ShootdownRequest>> = IrqSpinLock::new(List::new());

/// Global shootdown sequence number (next to hand out)
static SEQ: AtomicU64 = AtomicU64::new(1);

/// Total requests ever issued
static TOTAL: AtomicU64 = AtomicU64::new(0);

static COMPLETE: Once<CompletionFn> = Once::new();

/// Install the completion hook. Called once by `task::init`.
pub fn set_completion(hook: CompletionFn) {
    COMPLETE.call_once(|| hook);
}

/// Allocate the next shootdown sequence number
pub fn next_seq() -> u64 {
    SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Register a shootdown for `pages` pages at `base` in `owner`'s address
/// space. The acknowledgement counter starts at the online CPU count; the
/// caller should service its own CPU immediately via [`service_local`].
pub fn request(
    seq: u64,
    owner: ProcessId,
    base: VirtAddr,
    pages: usize,
    frames: *mut PhysAddr,
    frame_count: usize,
) {
    let cpus = hal::hal().cpu_count();
    TOTAL.fetch_add(1, Ordering::Relaxed);
    METRICS.inc_tlb_shootdowns();

    tlb_log!(
        "shootdown #{}: pid {} {:#x} +{} pages, awaiting {} CPUs",
        seq,
        owner,
        base,
        pages,
        cpus
    );

    PENDING.lock().push_back(ShootdownRequest {
        seq,
        owner,
        base,
        pages,
        frames,
        frame_count,
        acks: AtomicUsize::new(cpus),
        cpu_mask: AtomicUsize::new(0),
    });
}

/// Acknowledge every pending request on the executing CPU.
///
/// Called opportunistically at syscall-dispatch entry; the last CPU to
/// acknowledge a request triggers its completion. Returns the number of
/// requests completed by this call.
pub fn service_local() -> usize {
    let hal = hal::hal();
    let cpu = hal.cpu_id();
    let bit = 1usize << cpu;
    let mut completed = 0usize;

    let mut q = PENDING.lock();
    if q.is_empty() {
        return 0;
    }

    for req in q.iter_mut() {
        // fetch_or makes the per-CPU acknowledgement exactly-once even if
        // two contexts claiming the same CPU id race here
        let prev = req.cpu_mask.fetch_or(bit, Ordering::AcqRel);
        if prev & bit == 0 {
            hal.invalidate_tlb(req.base, req.pages);
            req.acks.fetch_sub(1, Ordering::AcqRel);
        }
    }

    // Hand each fully-acknowledged request to the completion hook with
    // the queue lock dropped: completion takes the owner's process lock.
    loop {
        match q.remove_first(|r| r.acks.load(Ordering::Acquire) == 0) {
            Some(req) => {
                drop(q);
                complete(req);
                completed += 1;
                q = PENDING.lock();
            }
            None => break,
        }
    }

    completed
}

fn complete(req: ShootdownRequest) {
    tlb_log!("shootdown #{} complete", req.seq);
    let done = CompletedShootdown {
        seq: req.seq,
        owner: req.owner,
        base: req.base,
        pages: req.pages,
        frames: req.frames,
        frame_count: req.frame_count,
    };
    match COMPLETE.get() {
        Some(hook) => hook(done),
        None => panic!("[TLB] shootdown completed before task layer init"),
    }
}

/// Number of requests still awaiting acknowledgements
pub fn pending() -> usize {
    PENDING.lock().len()
}

/// (total requests ever, current sequence number) for the stats syscall
pub fn stats() -> (u64, u64) {
    (
        TOTAL.load(Ordering::Relaxed),
        SEQ.load(Ordering::Relaxed),
    )
}
