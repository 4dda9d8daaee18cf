//! Lock Ordering Documentation
//!
//! This kernel runs non-preemptively within a CPU and symmetrically across
//! CPUs; every mutable shared structure carries its own spinlock, and
//! deadlock freedom rests on shallow, outer-to-inner nesting. The rules:
//!
//! 1. **Process before thread.** An operation that needs both locks
//!    acquires the owning process first (`create_thread` encodes this in
//!    its signature: it takes the process guard).
//!
//! 2. **Queue before member.** The wait-queue and table locks are taken
//!    before the lock of any thread or object found while enumerating
//!    them. Sleeping therefore goes wait-queue → own thread, the same
//!    order the waker uses, so wake and sleep serialize instead of
//!    deadlocking. The ready queue is the one exception: it is a leaf
//!    taken *under* a thread lock (`sched::put` requires the caller to
//!    hold the thread), and the scheduler's pick path releases it before
//!    touching any thread.
//!
//! 3. **Allocator locks are leaves.** The PFN database, slab caches and the
//!    kmalloc ladder never acquire any other kernel lock while held, so
//!    they may be taken from anywhere.
//!
//! 4. **Interrupts are disabled while any kernel lock is held** (the
//!    `IrqSpinLock` variants), keeping hold times bounded and trap handlers
//!    off held locks.
//!
//! The TLB shootdown acknowledgement counter is deliberately outside this
//! hierarchy: it is a per-request atomic countdown, not a lock (see
//! `mm/tlb.rs`).
