//! Syscall dispatch
//!
//! The trap glue (per-architecture, external) lands here with the trapped
//! context. The dispatcher extracts the opcode and up to three parameters,
//! locates the calling thread and process, services pending TLB
//! shootdowns, routes to the handler, and returns an action mask telling
//! the glue what to do with the CPU: resume the caller, requeue it and
//! pick another thread, leave it asleep, or finish its exit.
//!
//! Error philosophy (matching the rest of the kernel): user mistakes come
//! back as negative status codes, resource exhaustion comes back as
//! negative status codes, kernel invariant violations panic.

use bitflags::bitflags;

use crate::hal::{self, Context};
use crate::ipc::{self, IpcError, IpcOutcome, SendFlags};
use crate::metrics::METRICS;
use crate::mm::tlb;
use crate::sched;
use crate::sys_log;
use crate::task::{
    self, ProcessKind, ProcessRef, ProcessState, TaskError, ThreadRef,
};
use crate::wait::{self, futex, WaitKind, WaitOutcome};

// Dense opcode space, shared with the user-mode library
pub const SYSCALL_PING: usize = 0;
pub const SYSCALL_PUTS: usize = 1;
pub const SYSCALL_PROCESS_CREATE: usize = 2;
pub const SYSCALL_PROCESS_EXIT: usize = 3;
pub const SYSCALL_PROCESS_RECYCLE: usize = 4;
pub const SYSCALL_VM_ALLOC: usize = 5;
pub const SYSCALL_VM_MAP: usize = 6;
pub const SYSCALL_VM_MAP_CROSS: usize = 7;
pub const SYSCALL_VM_FREE: usize = 8;
pub const SYSCALL_THREAD_CREATE: usize = 9;
pub const SYSCALL_THREAD_CREATE_CROSS: usize = 10;
pub const SYSCALL_THREAD_YIELD: usize = 11;
pub const SYSCALL_THREAD_EXIT: usize = 12;
pub const SYSCALL_EVENT_WAIT: usize = 13;
pub const SYSCALL_EVENT_WAKE: usize = 14;
pub const SYSCALL_IPC_HANDLER: usize = 15;
pub const SYSCALL_IPC_REQUEST: usize = 16;
pub const SYSCALL_IPC_RESPOND: usize = 17;
pub const SYSCALL_IPC_RECEIVE: usize = 18;
pub const SYSCALL_STATS_KERNEL: usize = 19;

/// Wait kinds selectable through `SYSCALL_EVENT_WAIT`/`WAKE`
pub const EVENT_KIND_SLEEP: usize = 0;
pub const EVENT_KIND_OBJECT: usize = 1;
pub const EVENT_KIND_FUTEX: usize = 2;

/// Status written into a sleeper's context when its deadline fired
pub const STATUS_TIMED_OUT: isize = -8;
/// Status written into a sleeper's context when its wait was purged
pub const STATUS_WAIT_FAILED: isize = -9;

bitflags! {
    /// What the trap glue does after a syscall
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DispatchAction: u32 {
        /// Persist the trapped register context into the thread record
        const SAVE_CONTEXT = 1 << 0;
        /// Thread goes back to the ready queue; pick another
        const PUT_BACK     = 1 << 1;
        /// Return to the calling thread immediately
        const RESUME       = 1 << 2;
        /// The calling thread is done; pick another
        const EXIT_THREAD  = 1 << 3;
        /// Thread is asleep on the wait queue; pick another
        const SLEEP_WAIT   = 1 << 4;
        /// Thread is asleep in an IPC rendezvous; pick another
        const SLEEP_IPC    = 1 << 5;
    }
}

/// Per-syscall parameter/return record
pub struct DispatchInfo {
    pub params: [usize; 3],
    pub ret: [usize; 2],
}

/// The dispatcher's verdict for one trap
pub struct SyscallOutcome {
    pub status: isize,
    pub ret: [usize; 2],
    pub action: DispatchAction,
}

/// Syscall-visible error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysError {
    /// Unknown opcode
    BadSyscall,
    /// Allocation failed somewhere down the stack
    NoMemory,
    /// A pointer or address parameter is invalid
    BadAddress,
    /// The named process/thread/object does not exist
    NotFound,
    /// The target is in the wrong state
    Busy,
    /// The caller's process class may not do this
    Denied,
    /// The operation failed (IPC peer gone, handler missing, ...)
    Failed,
}

impl SysError {
    fn status(self) -> isize {
        match self {
            SysError::BadSyscall => -1,
            SysError::NoMemory => -2,
            SysError::BadAddress => -3,
            SysError::NotFound => -4,
            SysError::Busy => -5,
            SysError::Denied => -6,
            SysError::Failed => -7,
        }
    }
}

impl From<TaskError> for SysError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::ProcessNotFound | TaskError::ThreadNotFound | TaskError::NotAllocated => {
                SysError::NotFound
            }
            TaskError::OutOfMemory | TaskError::NoVmSpace => SysError::NoMemory,
            TaskError::BadMapping => SysError::BadAddress,
            TaskError::BadState | TaskError::Busy => SysError::Busy,
        }
    }
}

impl From<IpcError> for SysError {
    fn from(e: IpcError) -> Self {
        match e {
            IpcError::BadTarget => SysError::NotFound,
            IpcError::NoHandler | IpcError::NotWaitingReply | IpcError::Failed => SysError::Failed,
            IpcError::BadMessage => SysError::BadAddress,
            IpcError::OutOfMemory => SysError::NoMemory,
        }
    }
}

fn name_of(no: usize) -> &'static str {
    match no {
        SYSCALL_PING => "PING",
        SYSCALL_PUTS => "PUTS",
        SYSCALL_PROCESS_CREATE => "PROCESS_CREATE",
        SYSCALL_PROCESS_EXIT => "PROCESS_EXIT",
        SYSCALL_PROCESS_RECYCLE => "PROCESS_RECYCLE",
        SYSCALL_VM_ALLOC => "VM_ALLOC",
        SYSCALL_VM_MAP => "VM_MAP",
        SYSCALL_VM_MAP_CROSS => "VM_MAP_CROSS",
        SYSCALL_VM_FREE => "VM_FREE",
        SYSCALL_THREAD_CREATE => "THREAD_CREATE",
        SYSCALL_THREAD_CREATE_CROSS => "THREAD_CREATE_CROSS",
        SYSCALL_THREAD_YIELD => "THREAD_YIELD",
        SYSCALL_THREAD_EXIT => "THREAD_EXIT",
        SYSCALL_EVENT_WAIT => "EVENT_WAIT",
        SYSCALL_EVENT_WAKE => "EVENT_WAKE",
        SYSCALL_IPC_HANDLER => "IPC_HANDLER",
        SYSCALL_IPC_REQUEST => "IPC_REQUEST",
        SYSCALL_IPC_RESPOND => "IPC_RESPOND",
        SYSCALL_IPC_RECEIVE => "IPC_RECEIVE",
        SYSCALL_STATS_KERNEL => "STATS_KERNEL",
        _ => "INVALID",
    }
}

const RESUME: DispatchAction = DispatchAction::RESUME;

fn sleep_wait() -> DispatchAction {
    DispatchAction::SAVE_CONTEXT.union(DispatchAction::SLEEP_WAIT)
}

fn sleep_ipc() -> DispatchAction {
    DispatchAction::SAVE_CONTEXT.union(DispatchAction::SLEEP_IPC)
}

/// Route one syscall. `cur` is the trapping thread.
pub fn dispatch(cur: &ThreadRef, no: usize, params: [usize; 3]) -> SyscallOutcome {
    // Every CPU acknowledges pending shootdowns on its way in
    tlb::service_local();
    METRICS.inc_syscall(no);

    let mut info = DispatchInfo {
        params,
        ret: [0; 2],
    };

    // A thread of an exiting process folds into thread exit regardless of
    // what it asked for
    let proc = match task::acquire_process(cur.pid) {
        Some(p) => p,
        None => return exit_outcome(),
    };
    if proc.lock().state != ProcessState::Normal {
        return exit_outcome();
    }

    sys_log!("thread {} invoked {} (no={})", cur.id, name_of(no), no);

    let result = match no {
        SYSCALL_PING => sys_ping(&proc, cur, &mut info),
        SYSCALL_PUTS => sys_puts(&proc, cur, &mut info),
        SYSCALL_PROCESS_CREATE => sys_process_create(&proc, cur, &mut info),
        SYSCALL_PROCESS_EXIT => sys_process_exit(&proc, cur, &mut info),
        SYSCALL_PROCESS_RECYCLE => sys_process_recycle(&proc, cur, &mut info),
        SYSCALL_VM_ALLOC => sys_vm_alloc(&proc, cur, &mut info),
        SYSCALL_VM_MAP => sys_vm_map(&proc, cur, &mut info),
        SYSCALL_VM_MAP_CROSS => sys_vm_map_cross(&proc, cur, &mut info),
        SYSCALL_VM_FREE => sys_vm_free(&proc, cur, &mut info),
        SYSCALL_THREAD_CREATE => sys_thread_create(&proc, cur, &mut info),
        SYSCALL_THREAD_CREATE_CROSS => sys_thread_create_cross(&proc, cur, &mut info),
        SYSCALL_THREAD_YIELD => Ok(DispatchAction::SAVE_CONTEXT | DispatchAction::PUT_BACK),
        SYSCALL_THREAD_EXIT => Ok(DispatchAction::EXIT_THREAD),
        SYSCALL_EVENT_WAIT => sys_event_wait(&proc, cur, &mut info),
        SYSCALL_EVENT_WAKE => sys_event_wake(&proc, cur, &mut info),
        SYSCALL_IPC_HANDLER => sys_ipc_handler(&proc, cur, &mut info),
        SYSCALL_IPC_REQUEST => sys_ipc_request(&proc, cur, &mut info),
        SYSCALL_IPC_RESPOND => sys_ipc_respond(&proc, cur, &mut info),
        SYSCALL_IPC_RECEIVE => sys_ipc_receive(&proc, cur, &mut info),
        SYSCALL_STATS_KERNEL => sys_stats_kernel(&proc, cur, &mut info),
        _ => Err(SysError::BadSyscall),
    };

    match result {
        Ok(action) => SyscallOutcome {
            status: 0,
            ret: info.ret,
            action,
        },
        Err(e) => SyscallOutcome {
            status: e.status(),
            ret: info.ret,
            action: RESUME,
        },
    }
}

fn exit_outcome() -> SyscallOutcome {
    SyscallOutcome {
        status: 0,
        ret: [0; 2],
        action: DispatchAction::EXIT_THREAD,
    }
}

/// Full trap path: marshal parameters and results through the HAL, then
/// apply the side of the action that concerns the current thread. The
/// glue must call `sched::schedule()` (which never returns) whenever the
/// returned action lacks `RESUME`.
pub fn handle_trap(ctx: &mut Context) -> DispatchAction {
    let hal = hal::hal();
    let (no, params) = hal.get_syscall_params(ctx);

    let cur = sched::current_thread().expect("[SYSCALL] trap with no current thread");
    let out = dispatch(&cur, no, params);
    hal.set_syscall_return(ctx, out.status, out.ret[0], out.ret[1]);

    if out.action.contains(DispatchAction::SAVE_CONTEXT) {
        cur.lock().ctx = ctx.clone();
    }
    if out.action.contains(DispatchAction::PUT_BACK) {
        let mut tm = cur.lock();
        sched::put(&cur, &mut tm);
    }
    if out.action.contains(DispatchAction::EXIT_THREAD) {
        task::exit_thread(&cur);
    }
    if !out.action.contains(DispatchAction::RESUME) {
        sched::leave_cpu();
    }
    out.action
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn sys_ping(
    _proc: &ProcessRef,
    _cur: &ThreadRef,
    info: &mut DispatchInfo,
) -> Result<DispatchAction, SysError> {
    info.ret[0] = info.params[0];
    info.ret[1] = info.params[1];
    Ok(RESUME)
}

fn sys_puts(
    _proc: &ProcessRef,
    cur: &ThreadRef,
    info: &mut DispatchInfo,
) -> Result<DispatchAction, SysError> {
    let len = info.params[1].min(512);
    let mut buf = [0u8; 512];
    super::copy_from_user(cur, info.params[0], &mut buf[..len])?;
    match core::str::from_utf8(&buf[..len]) {
        Ok(s) => log::info!("[USER] {}", s.trim_end()),
        Err(_) => return Err(SysError::BadAddress),
    }
    Ok(RESUME)
}

fn sys_process_create(
    proc: &ProcessRef,
    cur: &ThreadRef,
    info: &mut DispatchInfo,
) -> Result<DispatchAction, SysError> {
    let kind = match info.params[2] {
        0 => ProcessKind::Kernel,
        1 => ProcessKind::Driver,
        2 => ProcessKind::System,
        3 => ProcessKind::User,
        4 => ProcessKind::Emulated,
        _ => return Err(SysError::BadSyscall),
    };
    // Only the kernel's own services may mint privileged processes
    if matches!(kind, ProcessKind::Kernel | ProcessKind::Driver)
        && !matches!(proc.kind, ProcessKind::Kernel | ProcessKind::System)
    {
        return Err(SysError::Denied);
    }

    let name_len = info.params[1].min(31);
    let mut name = [0u8; 31];
    super::copy_from_user(cur, info.params[0], &mut name[..name_len])?;
    let name = core::str::from_utf8(&name[..name_len]).map_err(|_| SysError::BadAddress)?;

    let pid = task::create_process(name, kind, proc.id)?;
    info.ret[0] = pid as usize;
    Ok(RESUME)
}

fn sys_process_exit(
    proc: &ProcessRef,
    _cur: &ThreadRef,
    info: &mut DispatchInfo,
) -> Result<DispatchAction, SysError> {
    let target = if info.params[0] == 0 {
        proc.id
    } else {
        info.params[0] as u64
    };
    if target != proc.id && !matches!(proc.kind, ProcessKind::Kernel | ProcessKind::System) {
        return Err(SysError::Denied);
    }

    task::exit_process(target)?;
    if target == proc.id {
        // Our own process is gone; this thread goes with it
        return Ok(DispatchAction::EXIT_THREAD);
    }
    Ok(RESUME)
}

fn sys_process_recycle(
    proc: &ProcessRef,
    _cur: &ThreadRef,
    info: &mut DispatchInfo,
) -> Result<DispatchAction, SysError> {
    if !matches!(proc.kind, ProcessKind::Kernel | ProcessKind::System) {
        return Err(SysError::Denied);
    }
    task::recycle_process(info.params[0] as u64)?;
    Ok(RESUME)
}

fn sys_vm_alloc(
    proc: &ProcessRef,
    _cur: &ThreadRef,
    info: &mut DispatchInfo,
) -> Result<DispatchAction, SysError> {
    let at = match info.params[1] {
        0 => None,
        addr => Some(addr),
    };
    let base = task::vm_user_alloc(proc, info.params[0], at)?;
    info.ret[0] = base;
    Ok(RESUME)
}

fn sys_vm_map(
    proc: &ProcessRef,
    _cur: &ThreadRef,
    info: &mut DispatchInfo,
) -> Result<DispatchAction, SysError> {
    // Mapping raw physical ranges is driver territory
    if !matches!(
        proc.kind,
        ProcessKind::Kernel | ProcessKind::Driver | ProcessKind::System
    ) {
        return Err(SysError::Denied);
    }
    let base = task::vm_map_phys(proc, info.params[0], info.params[1])?;
    info.ret[0] = base;
    Ok(RESUME)
}

fn sys_vm_map_cross(
    proc: &ProcessRef,
    _cur: &ThreadRef,
    info: &mut DispatchInfo,
) -> Result<DispatchAction, SysError> {
    let src = task::acquire_process(info.params[0] as u64).ok_or(SysError::NotFound)?;
    let base = task::vm_map_cross(proc, &src, info.params[1], info.params[2])?;
    info.ret[0] = base;
    Ok(RESUME)
}

fn sys_vm_free(
    proc: &ProcessRef,
    _cur: &ThreadRef,
    info: &mut DispatchInfo,
) -> Result<DispatchAction, SysError> {
    task::vm_user_free(proc, info.params[0])?;
    Ok(RESUME)
}

fn sys_thread_create(
    proc: &ProcessRef,
    _cur: &ThreadRef,
    info: &mut DispatchInfo,
) -> Result<DispatchAction, SysError> {
    let tid = {
        let mut pm = proc.lock();
        task::create_thread(proc, &mut pm, info.params[0], info.params[1], proc.kind.is_user())?
    };
    task::start_thread(tid)?;
    info.ret[0] = tid as usize;
    Ok(RESUME)
}

fn sys_thread_create_cross(
    proc: &ProcessRef,
    _cur: &ThreadRef,
    info: &mut DispatchInfo,
) -> Result<DispatchAction, SysError> {
    if !matches!(proc.kind, ProcessKind::Kernel | ProcessKind::System) {
        return Err(SysError::Denied);
    }
    let target = task::acquire_process(info.params[0] as u64).ok_or(SysError::NotFound)?;
    let tid = {
        let mut pm = target.lock();
        if pm.state != ProcessState::Normal {
            return Err(SysError::Busy);
        }
        task::create_thread(
            &target,
            &mut pm,
            info.params[1],
            info.params[2],
            target.kind.is_user(),
        )?
    };
    task::start_thread(tid)?;
    info.ret[0] = tid as usize;
    Ok(RESUME)
}

fn sys_event_wait(
    _proc: &ProcessRef,
    cur: &ThreadRef,
    info: &mut DispatchInfo,
) -> Result<DispatchAction, SysError> {
    let deadline = match info.params[2] {
        0 => None,
        ticks => Some(hal::hal().now_ticks() + ticks as u64),
    };

    match info.params[0] {
        EVENT_KIND_SLEEP => {
            let deadline = deadline.ok_or(SysError::BadSyscall)?;
            wait::sleep_thread(cur, WaitKind::Timeout, Some(deadline));
            Ok(sleep_wait())
        }
        EVENT_KIND_OBJECT => match wait::object_wait(cur, info.params[1] as u64, deadline) {
            WaitOutcome::Ready => Ok(RESUME),
            WaitOutcome::Blocked => Ok(sleep_wait()),
            WaitOutcome::Invalid => Err(SysError::BadAddress),
        },
        EVENT_KIND_FUTEX => match futex::futex_wait(cur, info.params[1], deadline) {
            WaitOutcome::Ready => Ok(RESUME),
            WaitOutcome::Blocked => Ok(sleep_wait()),
            WaitOutcome::Invalid => Err(SysError::BadAddress),
        },
        _ => Err(SysError::BadSyscall),
    }
}

fn sys_event_wake(
    proc: &ProcessRef,
    _cur: &ThreadRef,
    info: &mut DispatchInfo,
) -> Result<DispatchAction, SysError> {
    let count = if info.params[2] == 0 {
        usize::MAX
    } else {
        info.params[2]
    };

    match info.params[0] {
        EVENT_KIND_OBJECT => {
            info.ret[0] = wait::object_wake(proc.id, info.params[1] as u64, count);
            Ok(RESUME)
        }
        EVENT_KIND_FUTEX => {
            let woken =
                futex::futex_wake(proc.space, info.params[1], count).ok_or(SysError::BadAddress)?;
            info.ret[0] = woken;
            Ok(RESUME)
        }
        _ => Err(SysError::BadSyscall),
    }
}

fn sys_ipc_handler(
    proc: &ProcessRef,
    _cur: &ThreadRef,
    info: &mut DispatchInfo,
) -> Result<DispatchAction, SysError> {
    ipc::register_handler(proc, info.params[0]);
    Ok(RESUME)
}

fn sys_ipc_request(
    _proc: &ProcessRef,
    cur: &ThreadRef,
    info: &mut DispatchInfo,
) -> Result<DispatchAction, SysError> {
    let flags = SendFlags::from_bits_truncate(info.params[2] as u32);
    match ipc::request(cur, info.params[0] as u64, info.params[1] as u64, flags)? {
        IpcOutcome::Delivered => Ok(RESUME),
        IpcOutcome::Blocked => Ok(sleep_ipc()),
    }
}

fn sys_ipc_respond(
    _proc: &ProcessRef,
    cur: &ThreadRef,
    _info: &mut DispatchInfo,
) -> Result<DispatchAction, SysError> {
    ipc::respond(cur)?;
    Ok(RESUME)
}

fn sys_ipc_receive(
    _proc: &ProcessRef,
    cur: &ThreadRef,
    _info: &mut DispatchInfo,
) -> Result<DispatchAction, SysError> {
    match ipc::receive(cur)? {
        IpcOutcome::Delivered => Ok(RESUME),
        IpcOutcome::Blocked => Ok(sleep_ipc()),
    }
}

fn sys_stats_kernel(
    _proc: &ProcessRef,
    cur: &ThreadRef,
    info: &mut DispatchInfo,
) -> Result<DispatchAction, SysError> {
    let snapshot = super::stats::capture();
    let size = core::mem::size_of::<super::stats::KernelStats>();
    let len = info.params[1].min(size);

    let bytes = unsafe {
        core::slice::from_raw_parts(&snapshot as *const _ as *const u8, size)
    };
    super::copy_to_user(cur, info.params[0], &bytes[..len])?;
    info.ret[0] = size;
    Ok(RESUME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, set_cpu, spawn_test_thread};

    #[test]
    fn ping_echoes_params() {
        testutil::boot();
        set_cpu(0);
        let proc = testutil::test_process("sys-ping");
        let t = spawn_test_thread(&proc);

        let out = dispatch(&t, SYSCALL_PING, [123, 456, 0]);
        assert_eq!(out.status, 0);
        assert_eq!(out.ret, [123, 456]);
        assert_eq!(out.action, DispatchAction::RESUME);
        testutil::retire_test_thread(t);
    }

    #[test]
    fn illegal_opcode_is_an_error_not_a_panic() {
        testutil::boot();
        set_cpu(0);
        let proc = testutil::test_process("sys-bad");
        let t = spawn_test_thread(&proc);

        let out = dispatch(&t, 9999, [0; 3]);
        assert!(out.status < 0);
        assert_eq!(out.action, DispatchAction::RESUME);
        testutil::retire_test_thread(t);
    }

    #[test]
    fn yield_requeues_with_context_save() {
        testutil::boot();
        set_cpu(0);
        let proc = testutil::test_process("sys-yield");
        let t = spawn_test_thread(&proc);

        let out = dispatch(&t, SYSCALL_THREAD_YIELD, [0; 3]);
        assert_eq!(out.status, 0);
        assert_eq!(
            out.action,
            DispatchAction::SAVE_CONTEXT | DispatchAction::PUT_BACK
        );
        testutil::retire_test_thread(t);
    }

    #[test]
    fn event_wait_and_wake_through_dispatcher() {
        testutil::boot();
        set_cpu(0);
        let proc = testutil::test_process("sys-event");
        let waiter = spawn_test_thread(&proc);
        let waker = spawn_test_thread(&proc);
        let handle = 0x77usize;

        let out = dispatch(&waiter, SYSCALL_EVENT_WAIT, [EVENT_KIND_OBJECT, handle, 0]);
        assert_eq!(out.status, 0);
        assert!(out.action.contains(DispatchAction::SLEEP_WAIT));

        let out = dispatch(&waker, SYSCALL_EVENT_WAKE, [EVENT_KIND_OBJECT, handle, 1]);
        assert_eq!(out.status, 0);
        assert_eq!(out.ret[0], 1);
        assert_eq!(
            waiter.lock().state,
            crate::task::ThreadState::Normal
        );

        for t in [waiter, waker] {
            testutil::retire_test_thread(t);
        }
    }

    #[test]
    fn vm_syscalls_round_trip() {
        testutil::boot();
        let _serial = testutil::shootdown_serial();
        set_cpu(0);
        let proc = testutil::test_user_process("sys-vm");
        let t = spawn_test_thread(&proc);

        let out = dispatch(&t, SYSCALL_VM_ALLOC, [2 * crate::config::FRAME_SIZE, 0, 0]);
        assert_eq!(out.status, 0);
        let base = out.ret[0];
        assert!(base >= crate::config::USER_VM_BASE);

        let out = dispatch(&t, SYSCALL_VM_FREE, [base, 0, 0]);
        assert_eq!(out.status, 0);

        for cpu in 1..testutil::TEST_CPUS {
            set_cpu(cpu);
            crate::mm::tlb::service_local();
        }
        set_cpu(0);
        assert!(proc.lock().vm.find_avail(base).is_some());
        testutil::retire_test_thread(t);
    }

    #[test]
    fn stats_snapshot_into_kernel_thread() {
        testutil::boot();
        set_cpu(0);
        let proc = testutil::test_process("sys-stats");
        let t = spawn_test_thread(&proc);

        let mut buf = [0u8; core::mem::size_of::<super::super::stats::KernelStats>()];
        let out = dispatch(
            &t,
            SYSCALL_STATS_KERNEL,
            [buf.as_mut_ptr() as usize, buf.len(), 0],
        );
        assert_eq!(out.status, 0);
        assert_eq!(out.ret[0], buf.len());

        let stats: &super::super::stats::KernelStats =
            unsafe { &*(buf.as_ptr() as *const _) };
        assert!(stats.processes >= 1);
        assert!(stats.threads >= 1);
        assert!(stats.syscalls >= 1);
        assert!(stats.pages_total > 0);
        assert!(stats.slab_classes > 0);
        testutil::retire_test_thread(t);
    }

    #[test]
    fn user_class_cannot_mint_drivers() {
        testutil::boot();
        set_cpu(0);
        let proc = testutil::test_user_process("sys-user");
        let t = spawn_test_thread(&proc);

        let name = b"rogue";
        let out = dispatch(
            &t,
            SYSCALL_PROCESS_CREATE,
            [name.as_ptr() as usize, name.len(), 1],
        );
        assert_eq!(out.status, SysError::Denied.status());
        testutil::retire_test_thread(t);
    }
}
