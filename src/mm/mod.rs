//! Memory Management Module
//!
//! Coordinates the PFN database (physical frames), the slab allocator, the
//! kernel heap ladder built on it, the per-process VM block allocator, and
//! the TLB shootdown coordinator.
//!
//! Bootstrap order matters: the PFN database exists first (it carves its
//! own entry table out of the boot memory map), then the slab/heap layer
//! that requests backing frames from it. `init` runs the sequence once.

pub mod allocator;
pub mod pfn;
pub mod slab;
pub mod tlb;
pub mod vm;

use core::sync::atomic::{AtomicUsize, Ordering};

pub use crate::config::FRAME_SIZE;
use crate::mm_log;
pub use crate::hal::{PhysAddr, VirtAddr};

/// A firmware-described physical memory range
#[derive(Debug, Clone, Copy)]
pub struct BootRegion {
    /// First physical address of the range
    pub base: PhysAddr,
    /// Length in bytes
    pub len: usize,
    /// What the firmware says lives here
    pub kind: BootRegionKind,
}

/// Classification of a boot memory range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootRegionKind {
    /// Free RAM the kernel may allocate from
    Usable,
    /// Firmware/device-reserved, never touched
    Reserved,
    /// Occupied by the kernel image
    Kernel,
}

/// Offset of the direct physical-memory map in kernel virtual space.
/// Installed once at boot; zero means identity (host tests, early boot).
static DMAP_OFFSET: AtomicUsize = AtomicUsize::new(0);

/// Translate a physical address through the kernel direct map
#[inline]
pub fn phys_to_virt(pa: PhysAddr) -> *mut u8 {
    (pa + DMAP_OFFSET.load(Ordering::Relaxed)) as *mut u8
}

/// Initialize the memory subsystem from the boot memory map.
///
/// `dmap_offset` is the offset of the direct map the embedding binary set
/// up; it must preserve the slab allocation-unit alignment (it is a
/// constant huge-page-aligned offset on every supported configuration).
pub fn init(dmap_offset: usize, map: &[BootRegion]) {
    DMAP_OFFSET.store(dmap_offset, Ordering::Relaxed);
    pfn::init(map);
    allocator::init();
    mm_log!("memory subsystem up");
}
