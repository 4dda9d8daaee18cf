/// SpinLock implementation for multi-core synchronization
///
/// This module provides the kernel's two spinlock flavors. Both busy-wait
/// on a compare-and-swap loop with exponential backoff and the architecture
/// pause hint between attempts; unlock raises the architecture event hint
/// so waiters parked on `wait_for_event` re-check promptly.
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::hal;

const MAX_BACKOFF: usize = 256;

/// A mutual exclusion primitive useful for protecting shared data
///
/// The lock is automatically released when the guard goes out of scope.
///
/// # Examples
///
/// ```ignore
/// let lock = SpinLock::new(5);
/// {
///     let mut data = lock.lock();
///     *data += 1;
/// } // lock is released here
/// ```
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

/// A guard that provides mutable access to the data protected by a SpinLock
///
/// When the guard is dropped, the lock is automatically released.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock wrapping the supplied data
    pub const fn new(data: T) -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock, spinning until it is available
    ///
    /// Uses exponential backoff to reduce bus contention when multiple
    /// cores compete for the same lock.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let mut backoff = 1;

        loop {
            // Acquire ordering so all subsequent reads see the latest data
            if self
                .locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinLockGuard { lock: self };
            }

            for _ in 0..backoff {
                hal::relax();
            }

            if backoff < MAX_BACKOFF {
                backoff *= 2;
            }
        }
    }

    /// Attempts to acquire the lock without spinning
    ///
    /// Returns `Some(SpinLockGuard)` if the lock was acquired, or `None`
    /// if it is currently held elsewhere.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Consumes the lock and returns the underlying data
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release ordering so all writes are visible to the next holder
        self.lock.locked.store(false, Ordering::Release);
        hal::notify();
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self.try_lock() {
            Some(guard) => write!(f, "SpinLock {{ data: {:?} }}", &*guard),
            None => write!(f, "SpinLock {{ <locked> }}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Interrupt-safe variant
// ---------------------------------------------------------------------------

/// Lock word bit: the lock is held
const LOCKED: usize = 1 << 0;

/// Lock word bit: interrupts were enabled before the holder acquired
const IRQ_WAS_ON: usize = 1 << 1;

/// An IRQ-safe spinlock that disables interrupts while the lock is held
///
/// The prior interrupt-enabled state is packed into bit 1 of the lock word
/// itself, so releasing needs no context beyond the lock: whoever holds it
/// can release it and the right interrupt state comes back.
///
/// Required whenever a lock may be touched from trap handlers; in practice
/// every lock guarding scheduler, wait-queue or task state is one of these.
pub struct IrqSpinLock<T> {
    word: AtomicUsize,
    data: UnsafeCell<T>,
}

/// A guard for data protected by an [`IrqSpinLock`]
///
/// Dropping the guard releases the lock and restores the interrupt state
/// recorded in the lock word.
pub struct IrqSpinLockGuard<'a, T> {
    lock: &'a IrqSpinLock<T>,
}

unsafe impl<T: Send> Sync for IrqSpinLock<T> {}
unsafe impl<T: Send> Send for IrqSpinLock<T> {}

impl<T> IrqSpinLock<T> {
    /// Creates a new IRQ-safe spinlock wrapping the supplied data
    pub const fn new(data: T) -> Self {
        IrqSpinLock {
            word: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock with local interrupts disabled
    ///
    /// The prior interrupt state travels in the lock word; the guard's drop
    /// restores it.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let mut backoff = 1;

        loop {
            let was_on = hal::irq_disable();
            let locked = if was_on { LOCKED | IRQ_WAS_ON } else { LOCKED };

            if self
                .word
                .compare_exchange(0, locked, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return IrqSpinLockGuard { lock: self };
            }

            // Contended: re-enable interrupts while we spin so this CPU
            // still takes traps, then retry from the top.
            hal::irq_restore(was_on);

            for _ in 0..backoff {
                hal::relax();
            }

            if backoff < MAX_BACKOFF {
                backoff *= 2;
            }
        }
    }

    /// Attempts to acquire the lock without spinning
    ///
    /// On failure the interrupt state is restored and `None` returned.
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let was_on = hal::irq_disable();
        let locked = if was_on { LOCKED | IRQ_WAS_ON } else { LOCKED };

        if self
            .word
            .compare_exchange(0, locked, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqSpinLockGuard { lock: self })
        } else {
            hal::irq_restore(was_on);
            None
        }
    }

    /// Consumes the lock and returns the underlying data
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        let word = self.lock.word.load(Ordering::Relaxed);
        let was_on = word & IRQ_WAS_ON != 0;
        self.lock.word.store(0, Ordering::Release);
        hal::irq_restore(was_on);
        hal::notify();
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for IrqSpinLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self.try_lock() {
            Some(guard) => write!(f, "IrqSpinLock {{ data: {:?} }}", &*guard),
            None => write!(f, "IrqSpinLock {{ <locked> }}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    const INCREMENTS: usize = 163840;

    fn hammer(threads: usize) {
        let lock = Arc::new(SpinLock::new(0usize));
        let mut handles = Vec::new();

        for _ in 0..threads {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..INCREMENTS {
                    *lock.lock() += 1;
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*lock.lock(), threads * INCREMENTS);
    }

    #[test]
    fn mutual_exclusion_single() {
        hammer(1);
    }

    #[test]
    fn mutual_exclusion_two() {
        hammer(2);
    }

    #[test]
    fn mutual_exclusion_four() {
        hammer(4);
    }

    #[test]
    fn mutual_exclusion_eight() {
        hammer(8);
    }

    #[test]
    fn mutual_exclusion_sixteen() {
        hammer(16);
    }

    #[test]
    fn try_lock_contended() {
        let lock = SpinLock::new(7);
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert_eq!(*lock.try_lock().unwrap(), 7);
    }

    #[test]
    fn irq_variant_excludes() {
        // Without an installed HAL the irq hooks are no-ops, leaving the
        // plain mutual-exclusion behavior to verify.
        let lock = Arc::new(IrqSpinLock::new(0usize));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..INCREMENTS {
                    *lock.lock() += 1;
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*lock.lock(), 4 * INCREMENTS);
    }

    #[test]
    fn into_inner_returns_data() {
        let lock = SpinLock::new(42);
        assert_eq!(lock.into_inner(), 42);
    }
}
