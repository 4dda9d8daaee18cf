//! Syscall surface
//!
//! The dispatcher ([`syscall::dispatch`]) routes trapped syscalls to their
//! handlers and folds the result into an action mask the trap glue
//! executes. [`stats`] assembles the read-only kernel snapshot exported by
//! `SYSCALL_STATS_KERNEL`.

pub mod stats;
pub mod syscall;

pub use syscall::{dispatch, handle_trap, DispatchAction, DispatchInfo, SysError, SyscallOutcome};

use crate::config::FRAME_SIZE;
use crate::hal::{self, VirtAddr};
use crate::mm::phys_to_virt;
use crate::task::ThreadRef;

/// Copy bytes from a thread's address space into a kernel buffer,
/// page by page. Kernel threads address kernel memory directly.
pub(crate) fn copy_from_user(
    thread: &ThreadRef,
    va: VirtAddr,
    buf: &mut [u8],
) -> Result<(), SysError> {
    if !thread.user {
        unsafe {
            core::ptr::copy_nonoverlapping(va as *const u8, buf.as_mut_ptr(), buf.len());
        }
        return Ok(());
    }

    let hal = hal::hal();
    let mut done = 0usize;
    while done < buf.len() {
        let src = va + done;
        let page_off = src & (FRAME_SIZE - 1);
        let chunk = (FRAME_SIZE - page_off).min(buf.len() - done);
        let pa = hal
            .translate(thread.space, src & !(FRAME_SIZE - 1))
            .ok_or(SysError::BadAddress)?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                phys_to_virt(pa + page_off),
                buf.as_mut_ptr().add(done),
                chunk,
            );
        }
        done += chunk;
    }
    Ok(())
}

/// Copy kernel bytes into a thread's address space, page by page
pub(crate) fn copy_to_user(
    thread: &ThreadRef,
    va: VirtAddr,
    bytes: &[u8],
) -> Result<(), SysError> {
    if !thread.user {
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), va as *mut u8, bytes.len());
        }
        return Ok(());
    }

    let hal = hal::hal();
    let mut done = 0usize;
    while done < bytes.len() {
        let dst = va + done;
        let page_off = dst & (FRAME_SIZE - 1);
        let chunk = (FRAME_SIZE - page_off).min(bytes.len() - done);
        let pa = hal
            .translate(thread.space, dst & !(FRAME_SIZE - 1))
            .ok_or(SysError::BadAddress)?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr().add(done),
                phys_to_virt(pa + page_off),
                chunk,
            );
        }
        done += chunk;
    }
    Ok(())
}
