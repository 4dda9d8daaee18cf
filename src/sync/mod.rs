/// Synchronization primitives for multi-core support
///
/// This module provides the spinlocks, the readers-writer lock and the
/// rendezvous barrier the rest of the kernel is built on. All of them are
/// CAS-loop busy-wait primitives: true sleeping is implemented above this
/// layer by the wait queue, never here.
mod barrier;
mod rwlock;
mod spin;

pub mod lock_ordering;

pub use barrier::Barrier;
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use spin::{IrqSpinLock, IrqSpinLockGuard, SpinLock, SpinLockGuard};
