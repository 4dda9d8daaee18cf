//! Futex words
//!
//! A futex is a user/kernel-shared 32-bit word used as a fast-path lock:
//! uncontended lock/unlock never enters the kernel. The word packs three
//! bits the kernel understands:
//!
//! - `LOCKED`: the lock is held (user-mode CAS territory)
//! - `KERNEL`: sleepers may exist; an unlocker must call the wake path
//! - `VALID`: the word is an initialized futex at all
//!
//! Waiter and waker run the *same* CAS-retry protocol on the `KERNEL`
//! bit. The waiter re-checks the word after setting it and before
//! committing to sleep, and the waker clears it before scanning the
//! queue, so a wake cannot slip silently past a wait in either direction.
//!
//! Waiters are matched by the physical address behind the user's virtual
//! one, so processes sharing a mapping share the futex.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::FRAME_SIZE;
use crate::hal::{self, VirtAddr};
use crate::mm::phys_to_virt;
use crate::task::{ThreadRef, WakeStatus};

use super::{sleep_thread, wake_matching, WaitKind, WaitOutcome};

/// The lock is held
pub const FUTEX_LOCKED: u32 = 1 << 0;

/// Sleepers may exist; unlock must enter the kernel
pub const FUTEX_KERNEL: u32 = 1 << 1;

/// The word is an initialized futex
pub const FUTEX_VALID: u32 = 1 << 31;

/// Resolve a user futex word to its kernel-visible atomic, by way of the
/// physical frame behind it. `None` for unmapped or misaligned addresses.
fn word_for(space: usize, va: VirtAddr) -> Option<(&'static AtomicU32, usize)> {
    if va % core::mem::size_of::<u32>() != 0 {
        return None;
    }
    let page_pa = hal::hal().translate(space, va & !(FRAME_SIZE - 1))?;
    let pa = page_pa + (va & (FRAME_SIZE - 1));
    let word = unsafe { &*(phys_to_virt(pa) as *const AtomicU32) };
    Some((word, pa))
}

/// Block the calling thread until the word is unlocked or the deadline
/// passes.
///
/// The caller observed the lock contended in user mode; re-check here
/// under the CAS protocol, because the holder may have released in the
/// meantime, and sleeping then would be a lost wake-up.
pub fn futex_wait(thread: &ThreadRef, va: VirtAddr, deadline: Option<u64>) -> WaitOutcome {
    let (word, pa) = match word_for(thread.space, va) {
        Some(w) => w,
        None => return WaitOutcome::Invalid,
    };

    loop {
        let v = word.load(Ordering::Acquire);
        if v & FUTEX_VALID == 0 {
            return WaitOutcome::Invalid;
        }
        if v & FUTEX_LOCKED == 0 {
            // Released since the user-mode check; no sleep
            return WaitOutcome::Ready;
        }
        if word
            .compare_exchange(v, v | FUTEX_KERNEL, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            sleep_thread(thread, WaitKind::Futex { pa }, deadline);
            return WaitOutcome::Blocked;
        }
        // The word moved under us; retry the whole check
    }
}

/// Wake up to `max` sleepers of the futex at `va` in `space`.
///
/// Runs the waiter's CAS-retry protocol in reverse: clear the `KERNEL`
/// bit first, then wake. Returns the number woken; 0 with the bit clear
/// is the lock-free fast path (no sleeper ever existed).
pub fn futex_wake(space: usize, va: VirtAddr, max: usize) -> Option<usize> {
    let (word, pa) = word_for(space, va)?;

    loop {
        let v = word.load(Ordering::Acquire);
        if v & FUTEX_VALID == 0 {
            return None;
        }
        if v & FUTEX_KERNEL == 0 {
            // Fast path: nobody ever slept
            return Some(0);
        }
        if word
            .compare_exchange(v, v & !FUTEX_KERNEL, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }

    let woken = wake_matching(
        |e| e.kind == WaitKind::Futex { pa },
        max,
        WakeStatus::Ok,
    );

    // Sleepers we did not wake still need the unlock path to reach the
    // kernel next time: re-arm the bit for them.
    if super::QUEUE
        .lock()
        .iter()
        .any(|e| e.kind == WaitKind::Futex { pa })
    {
        loop {
            let v = word.load(Ordering::Acquire);
            if v & FUTEX_KERNEL != 0
                || word
                    .compare_exchange(v, v | FUTEX_KERNEL, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                break;
            }
        }
    }

    Some(woken)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ThreadState;
    use crate::testutil::{self, set_cpu, spawn_test_thread};
    use crate::wait::WaitOutcome;

    /// Build a mapped, initialized futex word in a fresh user process
    fn futex_fixture() -> (crate::task::ProcessRef, ThreadRef, VirtAddr) {
        let proc = testutil::test_user_process("futex");
        let thread = spawn_test_thread(&proc);
        let va = crate::task::vm_user_alloc(&proc, FRAME_SIZE, None).unwrap();

        let (word, _) = word_for(proc.space, va).unwrap();
        word.store(FUTEX_VALID, Ordering::Release);
        (proc, thread, va)
    }

    #[test]
    fn uncontended_wait_does_not_sleep() {
        testutil::boot();
        set_cpu(0);
        let (_proc, thread, va) = futex_fixture();

        // VALID but not LOCKED: the lock was released before we got here
        assert_eq!(futex_wait(&thread, va, None), WaitOutcome::Ready);
        assert_eq!(thread.lock().state, ThreadState::Normal);
        testutil::retire_test_thread(thread);
    }

    #[test]
    fn contended_wait_sleeps_and_wake_pairs() {
        testutil::boot();
        set_cpu(0);
        let (proc, thread, va) = futex_fixture();
        let (word, _) = word_for(proc.space, va).unwrap();

        word.store(FUTEX_VALID | FUTEX_LOCKED, Ordering::Release);
        assert_eq!(futex_wait(&thread, va, None), WaitOutcome::Blocked);
        assert_eq!(thread.lock().state, ThreadState::Wait);
        // The waiter marked the word for the kernel path
        assert_ne!(word.load(Ordering::Acquire) & FUTEX_KERNEL, 0);

        // Unlock: kernel bit set, so the wake path runs
        word.fetch_and(!FUTEX_LOCKED, Ordering::AcqRel);
        assert_eq!(futex_wake(proc.space, va, 1), Some(1));
        assert_eq!(thread.lock().state, ThreadState::Normal);
        // No sleepers left: the kernel bit stays clear
        assert_eq!(word.load(Ordering::Acquire) & FUTEX_KERNEL, 0);

        testutil::retire_test_thread(thread);
    }

    #[test]
    fn wake_without_sleepers_is_fast_path() {
        testutil::boot();
        set_cpu(0);
        let (proc, thread, va) = futex_fixture();
        assert_eq!(futex_wake(proc.space, va, 8), Some(0));
        testutil::retire_test_thread(thread);
    }

    #[test]
    fn partial_wake_rearms_kernel_bit() {
        testutil::boot();
        set_cpu(0);
        let (proc, t1, va) = futex_fixture();
        let t2 = spawn_test_thread(&proc);
        let (word, _) = word_for(proc.space, va).unwrap();

        word.store(FUTEX_VALID | FUTEX_LOCKED, Ordering::Release);
        assert_eq!(futex_wait(&t1, va, None), WaitOutcome::Blocked);
        assert_eq!(futex_wait(&t2, va, None), WaitOutcome::Blocked);

        word.fetch_and(!FUTEX_LOCKED, Ordering::AcqRel);
        assert_eq!(futex_wake(proc.space, va, 1), Some(1));

        // One sleeper remains: the kernel bit must be armed again
        assert_ne!(word.load(Ordering::Acquire) & FUTEX_KERNEL, 0);

        assert_eq!(futex_wake(proc.space, va, 1), Some(1));
        for t in [t1, t2] {
            testutil::retire_test_thread(t);
        }
    }

    #[test]
    fn invalid_word_rejected() {
        testutil::boot();
        set_cpu(0);
        let (proc, thread, va) = futex_fixture();
        let (word, _) = word_for(proc.space, va).unwrap();
        word.store(0, Ordering::Release); // VALID bit clear

        assert_eq!(futex_wait(&thread, va, None), WaitOutcome::Invalid);
        assert_eq!(futex_wait(&thread, va + 2, None), WaitOutcome::Invalid);
        testutil::retire_test_thread(thread);
    }
}
