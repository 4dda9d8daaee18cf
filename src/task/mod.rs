//! Thread & process management
//!
//! Owns the global thread/process tables, the acquire/release reference
//! discipline, and the process-level VM operations that drive the
//! two-phase free protocol in `mm::vm`/`mm::tlb`.
//!
//! Locking: process lock before thread lock, table lock before record
//! lock, and when two processes must be held at once (cross-process
//! mapping) the lower PID is taken first. See `sync::lock_ordering`.

pub mod process;
pub mod thread;

use core::sync::atomic::{AtomicU64, Ordering};
use spin::Once;

use crate::collections::{Dict, IdAllocator, SList};
use crate::config::{ASID_COUNT, FRAME_SIZE};
use crate::hal::{self, AddrSpace, PhysAddr, VirtAddr};
use crate::mm::allocator::{kfree, kmalloc};
use crate::mm::pfn::{self, AllocTag};
use crate::mm::slab::{self, SlabCache};
use crate::mm::tlb::{self, CompletedShootdown};
use crate::mm::vm::{VmBlock, VmBlockKind, VmSpace};
use crate::sync::IrqSpinLock;
use crate::task_log;

pub use process::{create_process, Process, ProcessKind, ProcessMut, ProcessRef, ProcessState};
pub use thread::{create_thread, Thread, ThreadMut, ThreadRef, ThreadState, WakeStatus};

/// Thread identifier
pub type ThreadId = u64;

/// Process identifier
pub type ProcessId = u64;

/// Task-management errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// No process with that ID
    ProcessNotFound,
    /// No thread with that ID
    ThreadNotFound,
    /// Allocation failed (frames, heap, or address space)
    OutOfMemory,
    /// No VM space satisfies the request
    NoVmSpace,
    /// The address is not allocated
    NotAllocated,
    /// A required translation or mapping is missing or invalid
    BadMapping,
    /// The record is in the wrong state for the operation
    BadState,
    /// Threads still exist where none may
    Busy,
}

/// Result type for task operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Table entry wrappers: raw record pointers, reached only through the
/// table locks.
pub(crate) struct ThreadPtr(pub(crate) *mut Thread);
pub(crate) struct ProcessPtr(pub(crate) *mut Process);

unsafe impl Send for ThreadPtr {}
unsafe impl Send for ProcessPtr {}

pub(crate) struct Tables {
    pub(crate) threads: IrqSpinLock<Dict<ThreadPtr>>,
    pub(crate) processes: IrqSpinLock<Dict<ProcessPtr>>,
    pub(crate) asids: IrqSpinLock<IdAllocator>,
    pub(crate) thread_cache: SlabCache,
    pub(crate) process_cache: SlabCache,
    pub(crate) next_tid: AtomicU64,
    pub(crate) next_pid: AtomicU64,
}

static TABLES: Once<Tables> = Once::new();

/// Live-thread and live-process counters for the stats syscall
pub(crate) static THREAD_COUNT: AtomicU64 = AtomicU64::new(0);
pub(crate) static PROCESS_COUNT: AtomicU64 = AtomicU64::new(0);

/// Exited kernel threads whose stacks await the reaper
static REAP: IrqSpinLock<SList<ThreadRef>> = IrqSpinLock::new(SList::new());

pub(crate) fn tables() -> &'static Tables {
    TABLES.get().expect("[TASK] tables used before init")
}

/// Initialize the task subsystem. Requires `mm::init` to have run.
pub fn init() {
    TABLES.call_once(|| Tables {
        threads: IrqSpinLock::new(Dict::new()),
        processes: IrqSpinLock::new(Dict::new()),
        asids: IrqSpinLock::new(IdAllocator::new(ASID_COUNT)),
        thread_cache: SlabCache::new("thread-records", core::mem::size_of::<Thread>()),
        process_cache: SlabCache::new("process-records", core::mem::size_of::<Process>()),
        next_tid: AtomicU64::new(1),
        next_pid: AtomicU64::new(1),
    });
    slab::register(&tables().thread_cache);
    slab::register(&tables().process_cache);
    tlb::set_completion(shootdown_complete);
    task_log!("task tables up ({} ASIDs)", ASID_COUNT);
}

/// Take a counted reference to a thread
pub fn acquire_thread(id: ThreadId) -> Option<ThreadRef> {
    let table = tables().threads.lock();
    let ptr = table.get(id)?.0;
    unsafe {
        (*ptr).refs.fetch_add(1, Ordering::AcqRel);
        Some(ThreadRef::from_counted(ptr))
    }
}

/// Take a counted reference to a process
pub fn acquire_process(id: ProcessId) -> Option<ProcessRef> {
    let table = tables().processes.lock();
    let ptr = table.get(id)?.0;
    unsafe {
        (*ptr).refs.fetch_add(1, Ordering::AcqRel);
        Some(ProcessRef::from_counted(ptr))
    }
}

/// Live thread count
pub fn thread_count() -> u64 {
    THREAD_COUNT.load(Ordering::Relaxed)
}

/// Live process count
pub fn process_count() -> u64 {
    PROCESS_COUNT.load(Ordering::Relaxed)
}

/// Queue a freshly created (`Enter`) thread for its first run
pub fn start_thread(id: ThreadId) -> TaskResult<()> {
    let thread = acquire_thread(id).ok_or(TaskError::ThreadNotFound)?;
    let mut tm = thread.lock();
    if tm.state != ThreadState::Enter {
        panic!("[TASK] start of thread {} in state {:?}", id, tm.state);
    }
    tm.state = ThreadState::Sched;
    crate::sched::put(&thread, &mut tm);
    Ok(())
}

/// Terminate a thread: unlink it everywhere, release its cross-references
/// and reclaim its memory block.
///
/// User blocks go through the normal reuse/two-phase VM path. A kernel
/// thread's stack may be the very stack this call runs on, so its block is
/// parked for the reaper, which frees it from its own stack.
pub fn exit_thread(cur: &ThreadRef) {
    // Unlist globally first: no new references past this point, and the
    // removal decides the single winner should two exits race
    if tables().threads.lock().remove(cur.id).is_none() {
        return;
    }
    THREAD_COUNT.fetch_sub(1, Ordering::Relaxed);

    let proc = acquire_process(cur.pid);
    if let Some(ref p) = proc {
        let mut pm = p.lock();
        pm.threads.remove_first(|t| *t == cur.id);
    }

    let (wait_peer, reply_peer) = {
        let mut tm = cur.lock();
        tm.state = ThreadState::Exit;
        (tm.ipc_wait.take(), tm.ipc_reply_to.take())
    };
    drop(wait_peer);
    drop(reply_peer);

    if cur.user {
        if let Some(p) = proc {
            // The reuse list usually absorbs this without a shootdown
            let _ = vm_user_free(&p, cur.block_base);
        }
        cur.lock().state = ThreadState::Clean;
    } else {
        REAP.lock().push_back(cur.clone());
    }

    task_log!("thread {} exited", cur.id);
}

/// Free the stacks of exited kernel threads. Runs on the wait-layer
/// worker's own stack, never on a stack being freed. Returns the number
/// of threads finished.
pub fn reap() -> usize {
    let mut done = 0;
    loop {
        let thread = match REAP.lock().pop_front() {
            Some(t) => t,
            None => break,
        };
        pfn::pfree(
            thread.block_phys,
            crate::config::THREAD_BLOCK_SIZE / FRAME_SIZE,
        );
        thread.lock().state = ThreadState::Clean;
        // Dropping `thread` may free the record
        done += 1;
    }
    done
}

/// Mark a process exiting and purge everything waiting on its behalf.
/// Threads drain through the dispatcher; memory is reclaimed by
/// [`recycle_process`].
pub fn exit_process(id: ProcessId) -> TaskResult<()> {
    let proc = acquire_process(id).ok_or(TaskError::ProcessNotFound)?;
    {
        let mut pm = proc.lock();
        if pm.state != ProcessState::Normal {
            return Err(TaskError::BadState);
        }
        pm.state = ProcessState::Exit;
    }

    let woken = crate::wait::purge_process(id);
    task_log!("process {} exiting, purged {} waiters", id, woken);
    Ok(())
}

/// Reclaim an exited process once its threads are gone: free every VM
/// block through the two-phase protocol, tear down the address space, and
/// retire the record.
pub fn recycle_process(id: ProcessId) -> TaskResult<()> {
    let proc = acquire_process(id).ok_or(TaskError::ProcessNotFound)?;
    {
        let pm = proc.lock();
        if pm.state != ProcessState::Exit {
            return Err(TaskError::BadState);
        }
        if !pm.threads.is_empty() {
            return Err(TaskError::Busy);
        }
    }

    // Drain allocated and parked-for-reuse blocks alike
    loop {
        let pending = {
            let mut pm = proc.lock();
            let block = pm.vm.take_any_inuse().or_else(|| pm.vm.take_reuse());
            block.map(|b| detach_block(proc.space, proc.id, &mut pm.vm, b))
        };
        match pending {
            Some(p) => submit_shootdown(p),
            None => break,
        }
    }

    let hal = hal::hal();
    hal.destroy_addr_space(proc.space);
    tables().asids.lock().free(proc.asid as usize);

    tables().processes.lock().remove(id);
    PROCESS_COUNT.fetch_sub(1, Ordering::Relaxed);
    proc.recycled.store(true, Ordering::Release);

    task_log!("process {} recycled", id);
    Ok(())
}

// ---------------------------------------------------------------------------
// Process-level VM operations
// ---------------------------------------------------------------------------

/// A stage-1 shootdown prepared under the process lock, submitted after
/// it is released (completion re-takes the lock)
struct PendingShootdown {
    seq: u64,
    owner: ProcessId,
    base: VirtAddr,
    pages: usize,
    frames: *mut PhysAddr,
    frame_count: usize,
}

/// Allocate and map `size` bytes of user VM; `at` requests an exact base.
pub fn vm_user_alloc(
    proc: &ProcessRef,
    size: usize,
    at: Option<VirtAddr>,
) -> TaskResult<VirtAddr> {
    let mut pm = proc.lock();
    let base = pm
        .vm
        .alloc(size, at, VmBlockKind::Generic, true)
        .map_err(|_| TaskError::NoVmSpace)?;
    let pages = ((size + FRAME_SIZE - 1) & !(FRAME_SIZE - 1)) / FRAME_SIZE;

    if let Err(e) = map_fresh_frames(proc.space, base, pages, true) {
        pm.vm.unwind_alloc(base);
        return Err(e);
    }
    Ok(base)
}

/// Free a user VM block. Thread-stack blocks are parked on the bounded
/// reuse list when it has room; everything else goes through the
/// two-phase shootdown free.
pub fn vm_user_free(proc: &ProcessRef, base: VirtAddr) -> TaskResult<()> {
    let cpus = hal::hal().cpu_count();

    let pending = {
        let mut pm = proc.lock();
        let mut block = pm.vm.take_inuse(base).ok_or(TaskError::NotAllocated)?;

        if block.kind == VmBlockKind::ThreadStack {
            match pm.vm.put_reuse(block, cpus) {
                None => return Ok(()),
                Some(overflow) => block = overflow,
            }
        }

        detach_block(proc.space, proc.id, &mut pm.vm, block)
    };

    submit_shootdown(pending);
    Ok(())
}

/// Map a physical range (device memory) into the process's window. The
/// frames are not owned by the block and are never freed through it.
pub fn vm_map_phys(proc: &ProcessRef, pa: PhysAddr, size: usize) -> TaskResult<VirtAddr> {
    if pa % FRAME_SIZE != 0 || size == 0 {
        return Err(TaskError::BadMapping);
    }

    let mut pm = proc.lock();
    let base = pm
        .vm
        .alloc(size, None, VmBlockKind::Generic, false)
        .map_err(|_| TaskError::NoVmSpace)?;
    let pages = ((size + FRAME_SIZE - 1) & !(FRAME_SIZE - 1)) / FRAME_SIZE;

    if !hal::hal().map_range(proc.space, base, pa, pages, true) {
        pm.vm.unwind_alloc(base);
        return Err(TaskError::OutOfMemory);
    }
    Ok(base)
}

/// Map `size` bytes of `src`'s block at `src_base` into `dst`'s window
/// (shared memory). The destination block does not own the frames.
pub fn vm_map_cross(
    dst: &ProcessRef,
    src: &ProcessRef,
    src_base: VirtAddr,
    size: usize,
) -> TaskResult<VirtAddr> {
    if dst.id == src.id {
        return Err(TaskError::BadMapping);
    }

    // Two process locks: lower PID first
    let (lo, hi) = if dst.id < src.id { (dst, src) } else { (src, dst) };
    let lo_pm = lo.lock();
    let hi_pm = hi.lock();
    let (mut dst_pm, src_pm) = if dst.id < src.id {
        (lo_pm, hi_pm)
    } else {
        (hi_pm, lo_pm)
    };

    let src_block = src_pm.vm.find_inuse(src_base).ok_or(TaskError::NotAllocated)?;
    if size == 0 || size > src_block.size {
        return Err(TaskError::BadMapping);
    }

    let base = dst_pm
        .vm
        .alloc(size, None, VmBlockKind::Generic, false)
        .map_err(|_| TaskError::NoVmSpace)?;
    let pages = ((size + FRAME_SIZE - 1) & !(FRAME_SIZE - 1)) / FRAME_SIZE;

    let hal = hal::hal();
    for i in 0..pages {
        let pa = match hal.translate(src.space, src_base + i * FRAME_SIZE) {
            Some(pa) => pa,
            None => {
                hal.unmap_range(dst.space, base, i);
                dst_pm.vm.unwind_alloc(base);
                return Err(TaskError::BadMapping);
            }
        };
        if !hal.map_range(dst.space, base + i * FRAME_SIZE, pa, 1, true) {
            hal.unmap_range(dst.space, base, i);
            dst_pm.vm.unwind_alloc(base);
            return Err(TaskError::OutOfMemory);
        }
    }
    Ok(base)
}

/// Back fresh frames behind `[base, base + pages)` in `space`, unwinding
/// completely on failure.
pub(crate) fn map_fresh_frames(
    space: AddrSpace,
    base: VirtAddr,
    pages: usize,
    user: bool,
) -> TaskResult<()> {
    let hal = hal::hal();

    let unwind = |mapped: usize| {
        for j in 0..mapped {
            let va = base + j * FRAME_SIZE;
            if let Some(pa) = hal.translate(space, va) {
                hal.unmap_range(space, va, 1);
                pfn::pfree(pa, 1);
            }
        }
    };

    for i in 0..pages {
        let pa = match pfn::palloc(1, 1, AllocTag::UserVm) {
            Some(pa) => pa,
            None => {
                unwind(i);
                return Err(TaskError::OutOfMemory);
            }
        };
        if !hal.map_range(space, base + i * FRAME_SIZE, pa, 1, user) {
            pfn::pfree(pa, 1);
            unwind(i);
            return Err(TaskError::OutOfMemory);
        }
    }
    Ok(())
}

/// Stage 1 under the process lock: capture the backing frames, detach the
/// translations, stamp the block and park it in `sanit_mapped`.
fn detach_block(
    space: AddrSpace,
    owner: ProcessId,
    vm: &mut VmSpace,
    mut block: VmBlock,
) -> PendingShootdown {
    let hal = hal::hal();
    let pages = block.size / FRAME_SIZE;
    let seq = tlb::next_seq();

    let mut frames: *mut PhysAddr = core::ptr::null_mut();
    let mut frame_count = 0usize;

    if block.owns_frames {
        frames = kmalloc(pages * core::mem::size_of::<PhysAddr>()) as *mut PhysAddr;
        if frames.is_null() {
            // Losing track of these frames would leak them forever; there
            // is no smaller-footprint fallback at this point.
            panic!("[TASK] cannot capture {} frames for reclamation", pages);
        }
        for i in 0..pages {
            if let Some(pa) = hal.translate(space, block.base + i * FRAME_SIZE) {
                unsafe {
                    *frames.add(frame_count) = pa;
                }
                frame_count += 1;
            }
        }
    }

    hal.unmap_range(space, block.base, pages);

    block.shoot_seq = seq;
    let base = block.base;
    vm.put_sanit_mapped(block);

    PendingShootdown {
        seq,
        owner,
        base,
        pages,
        frames,
        frame_count,
    }
}

/// Register the shootdown and acknowledge it on the initiating CPU. Must
/// be called with no process lock held: the final acknowledgement (which
/// may be ours) re-takes the owner's lock.
fn submit_shootdown(p: PendingShootdown) {
    tlb::request(p.seq, p.owner, p.base, p.pages, p.frames, p.frame_count);
    tlb::service_local();
}

/// Completion hook installed into `mm::tlb`: every CPU has flushed, so the
/// frames may be reused and the extent returns to the free list.
fn shootdown_complete(done: CompletedShootdown) {
    if !done.frames.is_null() {
        for i in 0..done.frame_count {
            unsafe {
                pfn::pfree(*done.frames.add(i), 1);
            }
        }
        kfree(done.frames as *mut u8);
    }

    // The owner may have been recycled while the request was in flight;
    // the frames above were the part that could not wait.
    if let Some(proc) = acquire_process(done.owner) {
        let mut pm = proc.lock();
        if pm.vm.finish_free(done.seq).is_some() {
            pm.vm.merge_reclaimed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::USER_VM_BASE;
    use crate::testutil::{self, set_cpu};

    #[test]
    fn process_and_kernel_thread_lifecycle() {
        testutil::boot();
        set_cpu(0);

        let pid = create_process("ktest", ProcessKind::Kernel, 0).unwrap();
        let proc = acquire_process(pid).unwrap();
        assert_eq!(proc.name_str(), "ktest");

        let tid = {
            let mut pm = proc.lock();
            create_thread(&proc, &mut pm, 0x1000, 42, false).unwrap()
        };
        let thread = acquire_thread(tid).unwrap();
        assert_eq!(thread.pid, pid);
        assert!(!thread.user);
        assert_eq!(thread.lock().state, ThreadState::Enter);

        start_thread(tid).unwrap();
        assert_eq!(thread.lock().state, ThreadState::Sched);

        exit_thread(&thread);
        assert!(acquire_thread(tid).is_none());

        // The reaper (ours, or any concurrently running worker's) frees
        // the kernel stack and finishes the transition
        reap();
        for _ in 0..100 {
            if thread.lock().state == ThreadState::Clean {
                break;
            }
            std::thread::yield_now();
            reap();
        }
        assert_eq!(thread.lock().state, ThreadState::Clean);
        drop(thread);
    }

    #[test]
    fn user_thread_block_layout_and_reuse() {
        testutil::boot();
        set_cpu(0);

        let pid = create_process("utest", ProcessKind::User, 1).unwrap();
        let proc = acquire_process(pid).unwrap();

        let tid = {
            let mut pm = proc.lock();
            create_thread(&proc, &mut pm, 0x4000_1000, 7, true).unwrap()
        };
        let thread = acquire_thread(tid).unwrap();
        let base = thread.block_base;
        assert!(base >= USER_VM_BASE);
        assert!(!thread.msg_send.is_null());

        // Message buffers are kernel-reachable: write through one side
        unsafe {
            *thread.msg_send = 0xEE;
            assert_eq!(*thread.msg_send, 0xEE);
        }

        exit_thread(&thread);
        drop(thread);

        // The stack block went to the reuse list; the next thread gets
        // the same base back without new mappings
        let tid2 = {
            let mut pm = proc.lock();
            create_thread(&proc, &mut pm, 0x4000_1000, 8, true).unwrap()
        };
        let t2 = acquire_thread(tid2).unwrap();
        assert_eq!(t2.block_base, base);
        exit_thread(&t2);
    }

    #[test]
    fn vm_free_completes_after_every_cpu_acks() {
        testutil::boot();
        let _serial = testutil::shootdown_serial();
        set_cpu(0);

        let pid = create_process("vmtest", ProcessKind::User, 1).unwrap();
        let proc = acquire_process(pid).unwrap();

        let size = 8 * FRAME_SIZE;
        let base = vm_user_alloc(&proc, size, None).unwrap();
        {
            let pm = proc.lock();
            assert!(pm.vm.find_inuse(base).is_some());
            pm.vm.check_invariants();
        }

        vm_user_free(&proc, base).unwrap();

        // Initiator (cpu 0) has acknowledged; the block is quarantined
        {
            let pm = proc.lock();
            assert!(pm.vm.find_inuse(base).is_none());
            assert!(pm.vm.find_avail(base).is_none());
        }

        // Remaining CPUs acknowledge at their next dispatch
        for cpu in 1..testutil::TEST_CPUS {
            set_cpu(cpu);
            tlb::service_local();
        }
        set_cpu(0);

        // Round-trip identity: the extent is free space again, coalesced
        let pm = proc.lock();
        let free = pm.vm.find_avail(base).expect("extent reclaimed");
        assert!(free.base <= base && base + size <= free.base + free.size);
        pm.vm.check_invariants();
    }

    #[test]
    fn exact_address_alloc_round_trip() {
        testutil::boot();
        let _serial = testutil::shootdown_serial();
        set_cpu(0);

        let pid = create_process("vmexact", ProcessKind::User, 1).unwrap();
        let proc = acquire_process(pid).unwrap();

        let want = USER_VM_BASE + 64 * FRAME_SIZE;
        let got = vm_user_alloc(&proc, 2 * FRAME_SIZE, Some(want)).unwrap();
        assert_eq!(got, want);

        // The same exact range is now occupied
        assert_eq!(
            vm_user_alloc(&proc, FRAME_SIZE, Some(want)),
            Err(TaskError::NoVmSpace)
        );

        vm_user_free(&proc, want).unwrap();
        for cpu in 1..testutil::TEST_CPUS {
            set_cpu(cpu);
            tlb::service_local();
        }
        set_cpu(0);
        assert!(proc.lock().vm.find_avail(want).is_some());
    }

    #[test]
    fn cross_mapping_shares_frames() {
        testutil::boot();
        set_cpu(0);

        let pid_a = create_process("share-a", ProcessKind::User, 1).unwrap();
        let pid_b = create_process("share-b", ProcessKind::User, 1).unwrap();
        let a = acquire_process(pid_a).unwrap();
        let b = acquire_process(pid_b).unwrap();

        let src = vm_user_alloc(&a, 2 * FRAME_SIZE, None).unwrap();
        let dst = vm_map_cross(&b, &a, src, 2 * FRAME_SIZE).unwrap();

        let hal = crate::hal::hal();
        let pa_a = hal.translate(a.space, src).unwrap();
        let pa_b = hal.translate(b.space, dst).unwrap();
        assert_eq!(pa_a, pa_b);
    }

    #[test]
    fn exit_and_recycle_reclaims() {
        testutil::boot();
        let _serial = testutil::shootdown_serial();
        set_cpu(0);

        let pid = create_process("dying", ProcessKind::User, 1).unwrap();
        let proc = acquire_process(pid).unwrap();
        vm_user_alloc(&proc, 4 * FRAME_SIZE, None).unwrap();

        // Recycle refuses while the process is alive
        assert_eq!(recycle_process(pid), Err(TaskError::BadState));

        exit_process(pid).unwrap();
        assert_eq!(proc.lock().state, ProcessState::Exit);

        recycle_process(pid).unwrap();
        assert!(acquire_process(pid).is_none());

        // Let the other CPUs drain the teardown shootdowns
        for cpu in 1..testutil::TEST_CPUS {
            set_cpu(cpu);
            tlb::service_local();
        }
        set_cpu(0);
        drop(proc);
    }
}
