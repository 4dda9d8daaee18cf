//! Process records and lifecycle
//!
//! A process owns its address space, ASID, VM block lists and an intrusive
//! list of its threads. State machine: `Enter → Normal → Exit`. Exit marks
//! and purges; the separate recycle step reclaims memory once the last
//! thread has drained through the dispatcher.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::collections::SList;
use crate::config::{USER_VM_BASE, USER_VM_TOP};
use crate::hal::{self, AddrSpace, VirtAddr};
use crate::mm::vm::VmSpace;
use crate::sync::{IrqSpinLock, IrqSpinLockGuard};
use crate::task_log;

use super::{tables, ProcessId, TaskError, TaskResult, ThreadId};

/// Process lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Record under construction
    Enter,
    /// Alive
    Normal,
    /// Terminating; threads drain, then recycle reclaims
    Exit,
}

/// Privilege class of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    /// The kernel's own worker threads
    Kernel,
    /// Device driver
    Driver,
    /// System service
    System,
    /// Ordinary user program
    User,
    /// Foreign-binary process under emulation
    Emulated,
}

impl ProcessKind {
    /// Whether threads of this process run in user mode
    pub fn is_user(&self) -> bool {
        !matches!(self, ProcessKind::Kernel)
    }
}

/// Mutable process state, guarded by the record's lock
pub struct ProcessMut {
    pub state: ProcessState,
    /// Threads belonging to this process
    pub threads: SList<ThreadId>,
    /// The VM window and its block lists
    pub vm: VmSpace,
    /// Entry point for popup IPC handler threads, once registered
    pub popup_entry: Option<VirtAddr>,
}

/// A process record
pub struct Process {
    pub id: ProcessId,
    pub parent: ProcessId,
    pub kind: ProcessKind,
    pub space: AddrSpace,
    pub asid: u16,
    /// NUL-padded process name
    pub name: [u8; 32],
    /// Creation time in scheduler ticks
    pub created: u64,
    pub(super) refs: AtomicUsize,
    /// Set by recycle once the record left the table; the last reference
    /// drop frees it
    pub(super) recycled: AtomicBool,
    pub(super) inner: IrqSpinLock<ProcessMut>,
}

impl Process {
    /// The name as a str, trimmed at the first NUL
    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|b| *b == 0).unwrap_or(32);
        core::str::from_utf8(&self.name[..len]).unwrap_or("<bad-utf8>")
    }
}

/// A counted reference to a process record
pub struct ProcessRef {
    ptr: NonNull<Process>,
}

unsafe impl Send for ProcessRef {}

impl ProcessRef {
    pub(super) unsafe fn from_counted(ptr: *mut Process) -> Self {
        ProcessRef {
            ptr: NonNull::new_unchecked(ptr),
        }
    }

    /// Lock the mutable state
    pub fn lock(&self) -> IrqSpinLockGuard<'_, ProcessMut> {
        self.inner.lock()
    }
}

impl core::ops::Deref for ProcessRef {
    type Target = Process;

    fn deref(&self) -> &Process {
        unsafe { self.ptr.as_ref() }
    }
}

impl Clone for ProcessRef {
    fn clone(&self) -> Self {
        self.refs.fetch_add(1, Ordering::AcqRel);
        ProcessRef { ptr: self.ptr }
    }
}

impl Drop for ProcessRef {
    fn drop(&mut self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let ptr = self.ptr.as_ptr();
        let gone = unsafe { (*ptr).recycled.load(Ordering::Acquire) };
        if gone {
            unsafe {
                core::ptr::drop_in_place(ptr);
            }
            tables().process_cache.free(ptr as *mut u8);
        }
    }
}

/// Create a process. The record enters the global table in `Normal` state
/// with no threads.
///
/// # Panics
/// Panics when the ASID space is exhausted; there is no reclaim protocol
/// for live ASIDs at this layer.
pub fn create_process(name: &str, kind: ProcessKind, parent: ProcessId) -> TaskResult<ProcessId> {
    let tables = tables();
    let hal = hal::hal();

    let space = hal.create_addr_space().ok_or(TaskError::OutOfMemory)?;
    let asid = tables
        .asids
        .lock()
        .alloc()
        .unwrap_or_else(|| panic!("[TASK] out of ASIDs")) as u16;

    let vm = if kind.is_user() {
        VmSpace::new(USER_VM_BASE, USER_VM_TOP)
    } else {
        VmSpace::empty()
    };

    let mut name_buf = [0u8; 32];
    let name_bytes = name.as_bytes();
    let copy = name_bytes.len().min(31);
    name_buf[..copy].copy_from_slice(&name_bytes[..copy]);

    let id = tables.next_pid.fetch_add(1, Ordering::Relaxed);
    let record = tables.process_cache.alloc().ok_or(TaskError::OutOfMemory)? as *mut Process;

    unsafe {
        core::ptr::write(
            record,
            Process {
                id,
                parent,
                kind,
                space,
                asid,
                name: name_buf,
                created: hal.now_ticks(),
                refs: AtomicUsize::new(0),
                recycled: AtomicBool::new(false),
                inner: IrqSpinLock::new(ProcessMut {
                    state: ProcessState::Enter,
                    threads: SList::new(),
                    vm,
                    popup_entry: None,
                }),
            },
        );
    }

    tables
        .processes
        .lock()
        .insert(id, super::ProcessPtr(record))
        .expect("[TASK] duplicate process id");
    super::PROCESS_COUNT.fetch_add(1, Ordering::Relaxed);

    // Construction is done; the process is alive
    let proc = super::acquire_process(id).expect("[TASK] freshly created process vanished");
    proc.lock().state = ProcessState::Normal;

    task_log!("created process {} '{}' ({:?})", id, proc.name_str(), kind);
    Ok(id)
}
