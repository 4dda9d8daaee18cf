/// Readers-writer lock
///
/// A single machine word packs the writer flag and the reader count, both
/// mutated only by compare-and-swap. Readers share, a writer excludes
/// everyone.
///
/// There is no fairness guarantee: a continuous stream of readers can
/// starve a writer indefinitely. This is a known design limitation; the
/// kernel's write paths are rare enough that it has not mattered.
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::hal;

/// Writer-held flag (top bit, keeps the reader count contiguous)
const WRITE: usize = 1 << (usize::BITS - 1);

/// Mask selecting the reader count
const READERS: usize = !WRITE;

const MAX_BACKOFF: usize = 256;

/// A readers-writer lock over `T`
pub struct RwLock<T> {
    word: AtomicUsize,
    data: UnsafeCell<T>,
}

/// Shared-access guard; dropping it releases one reader
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

/// Exclusive-access guard; dropping it releases the writer
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

unsafe impl<T: Send + Sync> Sync for RwLock<T> {}
unsafe impl<T: Send> Send for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a new readers-writer lock wrapping the supplied data
    pub const fn new(data: T) -> Self {
        RwLock {
            word: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires shared access, spinning while a writer holds the lock
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let mut backoff = 1;

        loop {
            let word = self.word.load(Ordering::Relaxed);

            if word & WRITE == 0 {
                // No writer: CAS the reader count up by one
                if self
                    .word
                    .compare_exchange_weak(word, word + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return RwLockReadGuard { lock: self };
                }
            }

            for _ in 0..backoff {
                hal::relax();
            }
            if backoff < MAX_BACKOFF {
                backoff *= 2;
            }
        }
    }

    /// Acquires exclusive access, spinning while readers or a writer hold
    /// the lock
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let mut backoff = 1;

        loop {
            if self
                .word
                .compare_exchange_weak(0, WRITE, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return RwLockWriteGuard { lock: self };
            }

            for _ in 0..backoff {
                hal::relax();
            }
            if backoff < MAX_BACKOFF {
                backoff *= 2;
            }
        }
    }

    /// Attempts shared access without spinning
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        let word = self.word.load(Ordering::Relaxed);
        if word & WRITE != 0 {
            return None;
        }
        self.word
            .compare_exchange(word, word + 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwLockReadGuard { lock: self })
    }

    /// Attempts exclusive access without spinning
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.word
            .compare_exchange(0, WRITE, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwLockWriteGuard { lock: self })
    }

    /// Consumes the lock and returns the underlying data
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        let prev = self.lock.word.fetch_sub(1, Ordering::Release);
        if prev & READERS == 0 {
            panic!("[SYNC] rwlock reader count underflow");
        }
        hal::notify();
    }
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.word.store(0, Ordering::Release);
        hal::notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    #[test]
    fn writers_exclude_writers() {
        const WRITERS: usize = 4;
        const LOOPS: usize = 163840;

        let lock = Arc::new(RwLock::new(0usize));
        let mut handles = Vec::new();

        for _ in 0..WRITERS {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..LOOPS {
                    *lock.write() += 1;
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*lock.read(), WRITERS * LOOPS);
    }

    #[test]
    fn readers_never_observe_tearing() {
        const LOOPS: usize = 20000;

        // The writer keeps both halves equal inside the critical section;
        // a reader seeing them differ means it saw a write mid-flight.
        let lock = Arc::new(RwLock::new((0usize, 0usize)));
        let mut handles = Vec::new();

        {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..LOOPS {
                    let mut pair = lock.write();
                    pair.0 += 1;
                    pair.1 += 1;
                }
            }));
        }

        for _ in 0..3 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..LOOPS {
                    let pair = lock.read();
                    assert_eq!(pair.0, pair.1);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*lock.read(), (LOOPS, LOOPS));
    }

    #[test]
    fn try_write_fails_under_reader() {
        let lock = RwLock::new(0);
        let r = lock.read();
        assert!(lock.try_write().is_none());
        drop(r);
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn readers_share() {
        let lock = RwLock::new(1);
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a + *b, 2);
    }
}
