//! Thread records and lifecycle
//!
//! A thread owns one contiguous memory block holding its stack, TLS and
//! message buffers at the fixed offsets from `config`. Kernel threads back
//! the block with a direct physical allocation reached through the direct
//! map; user threads carve a VM block from their process and map frames
//! into it page by page.
//!
//! State machine: `Enter → Sched → Normal → {Stall | Wait} → Exit → Clean`.
//! `Normal` is the only schedulable state. A record is destroyed only
//! after it reaches `Clean` *and* its reference count drains; `Clean` is
//! set strictly after the thread leaves the global table, so no new
//! reference can appear afterwards.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{
    FRAME_SIZE, TB_MSG_RECV_OFF, TB_MSG_SEND_OFF, TB_STACK_OFF, TB_STACK_SIZE, THREAD_BLOCK_SIZE,
};
use crate::hal::{self, AddrSpace, Context, PhysAddr, VirtAddr};
use crate::mm::pfn::{self, AllocTag};
use crate::mm::phys_to_virt;
use crate::mm::vm::VmBlockKind;
use crate::sync::{IrqSpinLock, IrqSpinLockGuard};
use crate::task_log;

use super::process::{ProcessMut, ProcessRef};
use super::{tables, TaskError, TaskResult, ProcessId, ThreadId};

/// Thread lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Record under construction
    Enter,
    /// Queued for its first run
    Sched,
    /// Runnable (the only schedulable state)
    Normal,
    /// Parked by a debugger or fault handler
    Stall,
    /// Asleep on the wait queue
    Wait,
    /// Terminating; unlisted, no new references
    Exit,
    /// Fully torn down; record freed when the last reference drops
    Clean,
}

/// Why the wait layer woke a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeStatus {
    /// Not woken by the wait layer
    None,
    /// The awaited condition arrived
    Ok,
    /// The deadline elapsed first
    TimedOut,
    /// The wait was purged (peer or process died)
    Failed,
}

/// Mutable thread state, guarded by the record's lock
pub struct ThreadMut {
    pub state: ThreadState,
    pub ctx: Context,
    pub wake_status: WakeStatus,
    /// Peer this thread awaits a reply from (reference held until the
    /// reply or a purge releases it)
    pub ipc_wait: Option<ThreadRef>,
    /// Peer this thread owes a reply to (reference held likewise)
    pub ipc_reply_to: Option<ThreadRef>,
}

/// A thread record
///
/// Immutable identity fields live outside the lock; everything that
/// changes after creation is inside [`ThreadMut`].
pub struct Thread {
    pub id: ThreadId,
    pub pid: ProcessId,
    pub user: bool,
    pub space: AddrSpace,
    pub asid: u16,
    /// Base of the thread memory block (user VA, or direct-map VA for
    /// kernel threads)
    pub block_base: VirtAddr,
    /// Physical base of a kernel thread's block (0 for user threads,
    /// whose frames are per-page)
    pub block_phys: PhysAddr,
    /// Kernel-visible addresses of the message buffers
    pub msg_send: *mut u8,
    pub msg_recv: *mut u8,
    /// Preferred CPU, `usize::MAX` when unpinned. A hint, not a mandate.
    pub pinned_cpu: AtomicUsize,
    pub(super) refs: AtomicUsize,
    pub(super) inner: IrqSpinLock<ThreadMut>,
}

// Safety: the message-buffer pointers reference memory owned by the
// thread block; all mutation goes through the record lock.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

/// A counted reference to a thread record
///
/// Acquiring a thread takes a reference; [`ThreadRef::lock`] then brackets
/// every touch of its mutable state. Dropping the last reference of a
/// `Clean` thread frees the record.
pub struct ThreadRef {
    ptr: NonNull<Thread>,
}

unsafe impl Send for ThreadRef {}

impl ThreadRef {
    /// Wrap `ptr` whose reference count was already incremented
    pub(super) unsafe fn from_counted(ptr: *mut Thread) -> Self {
        ThreadRef {
            ptr: NonNull::new_unchecked(ptr),
        }
    }

    /// Lock the mutable state
    pub fn lock(&self) -> IrqSpinLockGuard<'_, ThreadMut> {
        self.inner.lock()
    }

    /// Turn this reference into a raw pointer without releasing it; the
    /// scheduler parks the running CPU's reference this way.
    pub fn into_raw(self) -> *mut Thread {
        let ptr = self.ptr.as_ptr();
        core::mem::forget(self);
        ptr
    }

    /// Reconstitute a reference parked with [`ThreadRef::into_raw`]
    ///
    /// # Safety
    /// `ptr` must carry exactly one outstanding reference from `into_raw`.
    pub unsafe fn from_raw(ptr: *mut Thread) -> Self {
        ThreadRef {
            ptr: NonNull::new_unchecked(ptr),
        }
    }
}

/// Clone a reference on top of a parked raw pointer (the scheduler's
/// per-CPU current slot).
///
/// # Safety
/// `ptr` must point to a live record that already holds at least one
/// reference keeping it alive.
pub(crate) unsafe fn clone_from_raw(ptr: *mut Thread) -> ThreadRef {
    (*ptr).refs.fetch_add(1, Ordering::AcqRel);
    ThreadRef {
        ptr: NonNull::new_unchecked(ptr),
    }
}

impl core::ops::Deref for ThreadRef {
    type Target = Thread;

    fn deref(&self) -> &Thread {
        unsafe { self.ptr.as_ref() }
    }
}

impl Clone for ThreadRef {
    fn clone(&self) -> Self {
        self.refs.fetch_add(1, Ordering::AcqRel);
        ThreadRef { ptr: self.ptr }
    }
}

impl Drop for ThreadRef {
    fn drop(&mut self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        // Last reference gone. Only an unlisted thread can be Clean, so
        // nobody can resurrect it. If the lock is held, the holder still
        // carries a reference (a re-acquire racing this drop) and the
        // record cannot be Clean yet, so skip.
        let ptr = self.ptr.as_ptr();
        let clean = {
            let thread = unsafe { &*ptr };
            match thread.inner.try_lock() {
                Some(guard) => guard.state == ThreadState::Clean,
                None => false,
            }
        };

        if clean {
            unsafe {
                core::ptr::drop_in_place(ptr);
            }
            tables().thread_cache.free(ptr as *mut u8);
        }
    }
}

/// Backing memory of a freshly created thread, before the record exists
pub(super) struct ThreadBlock {
    pub base: VirtAddr,
    pub phys: PhysAddr,
    pub msg_send: *mut u8,
    pub msg_recv: *mut u8,
}

/// Allocate and map the memory block for a new thread.
///
/// Kernel threads take one contiguous physical allocation addressed
/// through the direct map. User threads first try the process's bounded
/// reuse list (a still-mapped stack from an exited thread), then carve a
/// fresh VM block and map frames page by page.
pub(super) fn alloc_thread_block(
    proc: &ProcessRef,
    pm: &mut ProcessMut,
    user: bool,
) -> TaskResult<ThreadBlock> {
    let pages = THREAD_BLOCK_SIZE / FRAME_SIZE;

    if !user {
        let phys = pfn::palloc(pages, 1, AllocTag::ThreadBlock).ok_or(TaskError::OutOfMemory)?;
        let base = phys_to_virt(phys) as VirtAddr;
        return Ok(ThreadBlock {
            base,
            phys,
            msg_send: (base + TB_MSG_SEND_OFF) as *mut u8,
            msg_recv: (base + TB_MSG_RECV_OFF) as *mut u8,
        });
    }

    let base = match pm.vm.take_reuse() {
        Some(block) => {
            // Still mapped from its previous owner; re-account it as in use
            let base = block.base;
            pm.vm.put_inuse(block);
            base
        }
        None => {
            let base = pm
                .vm
                .alloc(THREAD_BLOCK_SIZE, None, VmBlockKind::ThreadStack, true)
                .map_err(|_| TaskError::OutOfMemory)?;
            if let Err(e) = super::map_fresh_frames(proc.space, base, pages, true) {
                pm.vm.unwind_alloc(base);
                return Err(e);
            }
            base
        }
    };

    let hal = hal::hal();
    let send_pa = hal
        .translate(proc.space, base + TB_MSG_SEND_OFF)
        .ok_or(TaskError::BadMapping)?;
    let recv_pa = hal
        .translate(proc.space, base + TB_MSG_RECV_OFF)
        .ok_or(TaskError::BadMapping)?;

    Ok(ThreadBlock {
        base,
        phys: 0,
        msg_send: phys_to_virt(send_pa),
        msg_recv: phys_to_virt(recv_pa),
    })
}

/// Create a thread in `proc` starting at `entry` with one start parameter.
///
/// The caller must hold the process's lock; the `&mut ProcessMut`
/// parameter makes that a compile-time fact rather than a runtime panic.
/// The new thread is left in `Enter`; `start_thread` queues it.
pub fn create_thread(
    proc: &ProcessRef,
    pm: &mut ProcessMut,
    entry: VirtAddr,
    param: usize,
    user: bool,
) -> TaskResult<ThreadId> {
    let block = alloc_thread_block(proc, pm, user)?;

    let tables = tables();
    let id = tables.next_tid.fetch_add(1, Ordering::Relaxed);

    let record = tables.thread_cache.alloc().ok_or(TaskError::OutOfMemory)? as *mut Thread;

    let mut ctx = Context::zeroed();
    let hal = hal::hal();
    let stack_top = block.base + TB_STACK_OFF + TB_STACK_SIZE;
    hal.init_context(&mut ctx, entry, stack_top, user);
    hal.set_context_param(&mut ctx, 0, param);

    unsafe {
        core::ptr::write(
            record,
            Thread {
                id,
                pid: proc.id,
                user,
                space: proc.space,
                asid: proc.asid,
                block_base: block.base,
                block_phys: block.phys,
                msg_send: block.msg_send,
                msg_recv: block.msg_recv,
                pinned_cpu: AtomicUsize::new(usize::MAX),
                refs: AtomicUsize::new(0),
                inner: IrqSpinLock::new(ThreadMut {
                    state: ThreadState::Enter,
                    ctx,
                    wake_status: WakeStatus::None,
                    ipc_wait: None,
                    ipc_reply_to: None,
                }),
            },
        );
    }

    tables
        .threads
        .lock()
        .insert(id, super::ThreadPtr(record))
        .expect("[TASK] duplicate thread id");
    pm.threads.push_back(id);
    super::THREAD_COUNT.fetch_add(1, Ordering::Relaxed);

    task_log!("created thread {} in process {} (user={})", id, proc.id, user);
    Ok(id)
}
