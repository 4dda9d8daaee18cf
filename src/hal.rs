//! Hardware abstraction layer contract
//!
//! The core is architecture-agnostic. Everything that touches registers,
//! page tables or interrupt hardware is reached through the [`Hal`] trait,
//! implemented by the per-architecture crate that embeds this one and
//! installed exactly once at boot via [`install`].
//!
//! Two rules shape this interface:
//!
//! - [`Hal::switch_context`] never returns. It is the single suspension
//!   point of the kernel; the next kernel code to run in that logical slot
//!   arrives through a fresh trap.
//! - The pause/event pair ([`Hal::wait_for_event`], [`Hal::send_event`]) is
//!   a hint. Implementations may no-op; the spin loops that use them remain
//!   correct without hardware support.

use spin::Once;

/// Physical address
pub type PhysAddr = usize;

/// Virtual address
pub type VirtAddr = usize;

/// Opaque handle to a hardware address space (page-table root)
pub type AddrSpace = usize;

/// Number of register slots in a saved context. Large enough for any
/// supported architecture's callee state plus trap frame.
pub const CONTEXT_SLOTS: usize = 40;

/// Saved register context of a thread.
///
/// The layout of the slots is private to the architecture; the core only
/// stores, hands out, and switches these.
#[repr(C)]
#[derive(Clone)]
pub struct Context {
    pub slots: [usize; CONTEXT_SLOTS],
}

impl Context {
    /// An all-zero context, filled in by [`Hal::init_context`]
    pub const fn zeroed() -> Self {
        Self {
            slots: [0; CONTEXT_SLOTS],
        }
    }
}

/// The contract every architecture implements for the core.
pub trait Hal: Send + Sync {
    /// Identity of the executing CPU, dense in `0..cpu_count()`
    fn cpu_id(&self) -> usize;

    /// Number of online CPUs
    fn cpu_count(&self) -> usize;

    /// Monotonic tick counter at [`crate::config::SCHED_HZ`]
    fn now_ticks(&self) -> u64;

    /// Disable local interrupts, returning whether they were enabled.
    /// The single returned bit is all the state a lock word needs to park.
    fn irq_disable(&self) -> bool;

    /// Re-enable local interrupts if `was_enabled` says they were
    fn irq_restore(&self, was_enabled: bool);

    /// Architecture pause hint for busy-wait loops
    fn wait_for_event(&self);

    /// Wake CPUs parked in [`Hal::wait_for_event`]
    fn send_event(&self);

    /// Build an initial register snapshot for a new thread
    fn init_context(&self, ctx: &mut Context, entry: VirtAddr, stack_top: VirtAddr, user: bool);

    /// Store a start parameter into an initialized context
    fn set_context_param(&self, ctx: &mut Context, index: usize, value: usize);

    /// Hand the CPU to the thread owning `ctx`. Never returns; kernel
    /// execution in this slot resumes only via a fresh trap.
    ///
    /// # Safety
    /// `ctx` must point to a fully initialized context whose thread is in a
    /// runnable state and whose address space is live.
    unsafe fn switch_context(&self, ctx: *mut Context) -> !;

    /// Create an empty hardware address space. `None` on exhaustion.
    fn create_addr_space(&self) -> Option<AddrSpace>;

    /// Tear down an address space previously created by
    /// [`Hal::create_addr_space`]. No mappings may remain.
    fn destroy_addr_space(&self, space: AddrSpace);

    /// Map `pages` frames starting at `pa` to `va` in `space`.
    /// Returns false if a page-table level could not be allocated.
    fn map_range(&self, space: AddrSpace, va: VirtAddr, pa: PhysAddr, pages: usize, user: bool)
        -> bool;

    /// Remove the translations for `pages` pages at `va` from `space`.
    /// Remote TLBs are the caller's problem (see [`crate::mm::tlb`]).
    fn unmap_range(&self, space: AddrSpace, va: VirtAddr, pages: usize);

    /// Query the physical frame backing `va` in `space`
    fn translate(&self, space: AddrSpace, va: VirtAddr) -> Option<PhysAddr>;

    /// Invalidate the local TLB entries for `pages` pages at `va`
    fn invalidate_tlb(&self, va: VirtAddr, pages: usize);

    /// Flush the entire local TLB
    fn flush_tlb(&self);

    /// Extract the syscall number and parameters from a trapped context
    fn get_syscall_params(&self, ctx: &Context) -> (usize, [usize; 3]);

    /// Write the syscall status and the two return slots into a trapped
    /// context
    fn set_syscall_return(&self, ctx: &mut Context, status: isize, ret0: usize, ret1: usize);
}

/// The installed HAL. One-time initialization at boot, no teardown.
static HAL: Once<&'static dyn Hal> = Once::new();

/// Install the architecture HAL. Must happen before any other core
/// subsystem is initialized; later calls are ignored.
pub fn install(hal: &'static dyn Hal) {
    HAL.call_once(|| hal);
}

/// Access the installed HAL.
///
/// # Panics
/// Panics if called before [`install`]; an invariant violation, since the
/// boot sequence installs the HAL first.
pub fn hal() -> &'static dyn Hal {
    *HAL.get().expect("[HAL] used before install")
}

/// Pause hint usable before the HAL is installed (early-boot spin loops).
#[inline]
pub fn relax() {
    match HAL.get() {
        Some(h) => h.wait_for_event(),
        None => core::hint::spin_loop(),
    }
}

/// Event hint usable before the HAL is installed.
#[inline]
pub fn notify() {
    if let Some(h) = HAL.get() {
        h.send_event();
    }
}

/// Disable local interrupts. Before the HAL is installed interrupts are
/// masked anyway, so this reports them as already off.
#[inline]
pub fn irq_disable() -> bool {
    match HAL.get() {
        Some(h) => h.irq_disable(),
        None => false,
    }
}

/// Restore local interrupts to the state reported by [`irq_disable`].
#[inline]
pub fn irq_restore(was_enabled: bool) {
    if let Some(h) = HAL.get() {
        h.irq_restore(was_enabled);
    }
}
