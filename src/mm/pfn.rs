// PFN database and physical frame allocator
// Per-frame metadata over the discovered physical range, built once at boot

use bitflags::bitflags;
use core::ptr;
use spin::Once;

use super::{phys_to_virt, BootRegion, BootRegionKind, PhysAddr, FRAME_SIZE};
use crate::mm_log;
use crate::sync::IrqSpinLock;

bitflags! {
    /// Per-frame state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PfnFlags: u8 {
        /// Frame is RAM the allocator may hand out
        const USABLE    = 1 << 0;
        /// Frame is currently allocated
        const INUSE     = 1 << 1;
        /// Frame content is known-zero
        const ZEROED    = 1 << 2;
        /// Frame belongs to the kernel itself (never reclaimed)
        const KERNEL    = 1 << 3;
        /// Frame may be paged out (unused by the core, kept for services)
        const SWAPPABLE = 1 << 4;
    }
}

/// What an allocated frame backs, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AllocTag {
    /// Not allocated
    None = 0,
    /// Kernel-internal allocation
    Kernel = 1,
    /// Slab allocator bucket
    Slab = 2,
    /// Thread memory block
    ThreadBlock = 3,
    /// User VM backing
    UserVm = 4,
    /// Page-table storage
    PageTable = 5,
}

/// Metadata for one physical frame
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PfnEntry {
    pub flags: PfnFlags,
    pub tag: AllocTag,
}

/// Read-only usage snapshot for the stats syscall
#[derive(Debug, Clone, Copy)]
pub struct PfnUsage {
    pub phys_base: PhysAddr,
    pub phys_limit: PhysAddr,
    pub entries: usize,
    pub total_usable: usize,
    pub free: usize,
}

/// The per-frame metadata table and first-fit frame allocator
///
/// Entries cover the physical range `[phys_base, phys_limit)` densely.
/// The table itself is carved out of the first usable region large enough
/// to hold it, before any other allocation exists.
pub struct PfnDatabase {
    entries: *mut PfnEntry,
    entry_count: usize,
    phys_base: PhysAddr,
    phys_limit: PhysAddr,
    total_usable: usize,
    free_frames: usize,
    /// Last allocated frame index, for faster sequential allocation
    last_alloc: usize,
}

// Safety: the table is owned by the database and protected by the global
// lock around it.
unsafe impl Send for PfnDatabase {}

impl PfnDatabase {
    /// Build the database by scanning the firmware memory map.
    ///
    /// Marks holes/reserved pages unusable, usable pages free, and reserves
    /// the frames backing the entry table itself.
    pub fn new(map: &[BootRegion]) -> Self {
        let mut phys_base = PhysAddr::MAX;
        let mut phys_limit = 0usize;

        for region in map {
            if region.kind == BootRegionKind::Usable {
                phys_base = phys_base.min(region.base);
                phys_limit = phys_limit.max(region.base + region.len);
            }
        }
        if phys_base >= phys_limit {
            panic!("[MM] boot map contains no usable memory");
        }

        // Frame-align inward so every entry covers a whole frame
        phys_base = (phys_base + FRAME_SIZE - 1) & !(FRAME_SIZE - 1);
        phys_limit &= !(FRAME_SIZE - 1);

        let entry_count = (phys_limit - phys_base) / FRAME_SIZE;
        let table_bytes = entry_count * core::mem::size_of::<PfnEntry>();
        let table_frames = table_bytes.div_ceil(FRAME_SIZE);

        // Place the table at the start of the first usable region that
        // can hold it
        let mut table_base = 0;
        for region in map {
            if region.kind != BootRegionKind::Usable {
                continue;
            }
            let base = (region.base + FRAME_SIZE - 1) & !(FRAME_SIZE - 1);
            let end = (region.base + region.len) & !(FRAME_SIZE - 1);
            if end > base && end - base >= table_frames * FRAME_SIZE {
                table_base = base;
                break;
            }
        }
        if table_base == 0 {
            panic!("[MM] no usable region can hold the PFN table");
        }

        let entries = phys_to_virt(table_base) as *mut PfnEntry;
        unsafe {
            for i in 0..entry_count {
                ptr::write(
                    entries.add(i),
                    PfnEntry {
                        flags: PfnFlags::empty(),
                        tag: AllocTag::None,
                    },
                );
            }
        }

        let mut db = PfnDatabase {
            entries,
            entry_count,
            phys_base,
            phys_limit,
            total_usable: 0,
            free_frames: 0,
            last_alloc: 0,
        };

        // Mark usable ranges free
        for region in map {
            if region.kind != BootRegionKind::Usable {
                continue;
            }
            let first = ((region.base + FRAME_SIZE - 1) & !(FRAME_SIZE - 1)).max(phys_base);
            let last = ((region.base + region.len) & !(FRAME_SIZE - 1)).min(phys_limit);
            let mut pa = first;
            while pa < last {
                let e = db.entry_mut((pa - phys_base) / FRAME_SIZE);
                e.flags = PfnFlags::USABLE;
                db.total_usable += 1;
                db.free_frames += 1;
                pa += FRAME_SIZE;
            }
        }

        // The table's own frames are the first allocation
        for i in 0..table_frames {
            let idx = (table_base - phys_base) / FRAME_SIZE + i;
            let e = db.entry_mut(idx);
            e.flags |= PfnFlags::INUSE | PfnFlags::KERNEL;
            e.tag = AllocTag::Kernel;
            db.free_frames -= 1;
        }

        db
    }

    fn entry_mut(&mut self, idx: usize) -> &mut PfnEntry {
        if idx >= self.entry_count {
            panic!("[MM] PFN index {} out of range", idx);
        }
        unsafe { &mut *self.entries.add(idx) }
    }

    fn entry(&self, idx: usize) -> &PfnEntry {
        if idx >= self.entry_count {
            panic!("[MM] PFN index {} out of range", idx);
        }
        unsafe { &*self.entries.add(idx) }
    }

    /// First-fit reservation of `count` contiguous frames whose physical
    /// base is aligned to `align_frames` frames.
    ///
    /// Returns the physical base, zeroed, or `None` when no run fits.
    pub fn reserve_free_pages(
        &mut self,
        count: usize,
        align_frames: usize,
        tag: AllocTag,
    ) -> Option<PhysAddr> {
        if count == 0 || !align_frames.is_power_of_two() {
            return None;
        }
        if self.free_frames < count {
            return None;
        }

        let align_bytes = align_frames * FRAME_SIZE;
        let start_hint = self.last_alloc;

        // Two passes: from the hint to the end, then from the bottom
        for pass in 0..2 {
            let (from, to) = if pass == 0 {
                (start_hint, self.entry_count)
            } else {
                (0, start_hint)
            };

            let mut idx = from;
            while idx + count <= to {
                // Align the candidate's absolute physical address
                let pa = self.phys_base + idx * FRAME_SIZE;
                let aligned = (pa + align_bytes - 1) & !(align_bytes - 1);
                let aligned_idx = (aligned - self.phys_base) / FRAME_SIZE;
                if aligned_idx != idx {
                    idx = aligned_idx;
                    continue;
                }
                if idx + count > to {
                    break;
                }

                match self.first_blocker(idx, count) {
                    None => {
                        // Claim the run
                        for i in idx..idx + count {
                            let e = self.entry_mut(i);
                            e.flags |= PfnFlags::INUSE;
                            e.flags |= PfnFlags::ZEROED;
                            e.tag = tag;
                        }
                        self.free_frames -= count;
                        self.last_alloc = idx + count;

                        let base = self.phys_base + idx * FRAME_SIZE;
                        unsafe {
                            ptr::write_bytes(phys_to_virt(base), 0, count * FRAME_SIZE);
                        }
                        return Some(base);
                    }
                    Some(blocker) => {
                        idx = blocker + 1;
                        // Keep alignment on the next round
                        let pa = self.phys_base + idx * FRAME_SIZE;
                        let aligned = (pa + align_bytes - 1) & !(align_bytes - 1);
                        idx = (aligned - self.phys_base) / FRAME_SIZE;
                    }
                }
            }
        }
        None
    }

    /// Scan `count` frames from `idx`; `None` if all free, else the index
    /// of the first blocker
    fn first_blocker(&self, idx: usize, count: usize) -> Option<usize> {
        for i in idx..idx + count {
            let e = self.entry(i);
            if !e.flags.contains(PfnFlags::USABLE) || e.flags.contains(PfnFlags::INUSE) {
                return Some(i);
            }
        }
        None
    }

    /// Return `count` frames starting at `base` to the free pool
    ///
    /// # Panics
    /// Panics on unaligned or out-of-range addresses and on double free,
    /// all programmer invariant violations.
    pub fn release_pages(&mut self, base: PhysAddr, count: usize) {
        if base % FRAME_SIZE != 0 {
            panic!("[MM] pfree of unaligned address {:#x}", base);
        }
        if base < self.phys_base || base + count * FRAME_SIZE > self.phys_limit {
            panic!("[MM] pfree outside managed range: {:#x}", base);
        }

        let idx = (base - self.phys_base) / FRAME_SIZE;
        for i in idx..idx + count {
            let e = self.entry_mut(i);
            if !e.flags.contains(PfnFlags::INUSE) {
                panic!("[MM] double pfree of frame {:#x}", base + (i - idx) * FRAME_SIZE);
            }
            e.flags.remove(PfnFlags::INUSE | PfnFlags::ZEROED);
            e.tag = AllocTag::None;
        }
        self.free_frames += count;
    }

    /// Usage snapshot
    pub fn usage(&self) -> PfnUsage {
        PfnUsage {
            phys_base: self.phys_base,
            phys_limit: self.phys_limit,
            entries: self.entry_count,
            total_usable: self.total_usable,
            free: self.free_frames,
        }
    }
}

/// The boot-built global database
static PFN_DB: Once<IrqSpinLock<PfnDatabase>> = Once::new();

/// Build the global database. Called once from `mm::init`.
pub fn init(map: &[BootRegion]) {
    PFN_DB.call_once(|| {
        let db = PfnDatabase::new(map);
        let usage = db.usage();
        mm_log!(
            "PFN database: {} frames over {:#x}..{:#x}, {} free",
            usage.entries,
            usage.phys_base,
            usage.phys_limit,
            usage.free
        );
        IrqSpinLock::new(db)
    });
}

fn db() -> &'static IrqSpinLock<PfnDatabase> {
    PFN_DB.get().expect("[MM] PFN database used before init")
}

/// Allocate `count` physically contiguous frames, base aligned to
/// `align_frames` frames. Zeroed. `None` on exhaustion.
pub fn palloc(count: usize, align_frames: usize, tag: AllocTag) -> Option<PhysAddr> {
    db().lock().reserve_free_pages(count, align_frames, tag)
}

/// Return frames taken with [`palloc`]
pub fn pfree(base: PhysAddr, count: usize) {
    db().lock().release_pages(base, count);
}

/// Global usage snapshot for the stats syscall
pub fn usage() -> PfnUsage {
    db().lock().usage()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A private database over its own leaked buffer, so counts are exact
    /// regardless of what other tests allocate globally
    fn private_db(frames: usize) -> PfnDatabase {
        let bytes = (frames + 2) * FRAME_SIZE;
        let buf = vec![0u8; bytes].leak();
        let base = (buf.as_ptr() as usize + FRAME_SIZE - 1) & !(FRAME_SIZE - 1);
        let len = (buf.as_ptr() as usize + bytes - base) & !(FRAME_SIZE - 1);
        PfnDatabase::new(&[BootRegion {
            base,
            len,
            kind: BootRegionKind::Usable,
        }])
    }

    #[test]
    fn alloc_free_roundtrip() {
        let mut db = private_db(32);
        let before = db.usage().free;

        let pa = db.reserve_free_pages(4, 1, AllocTag::Kernel).expect("frames");
        assert_eq!(pa % FRAME_SIZE, 0);
        assert_eq!(db.usage().free, before - 4);

        // Zeroed on allocation, even after being dirtied and recycled
        unsafe {
            let p = phys_to_virt(pa);
            for i in 0..4 * FRAME_SIZE {
                assert_eq!(*p.add(i), 0);
            }
            ptr::write_bytes(p, 0xFF, FRAME_SIZE);
        }
        db.release_pages(pa, 4);
        assert_eq!(db.usage().free, before);

        let pb = db.reserve_free_pages(4, 1, AllocTag::Kernel).expect("frames");
        unsafe {
            let p = phys_to_virt(pb);
            for i in 0..FRAME_SIZE {
                assert_eq!(*p.add(i), 0);
            }
        }
        db.release_pages(pb, 4);
    }

    #[test]
    fn exhaustion_is_an_error_not_a_panic() {
        let mut db = private_db(16);
        let free = db.usage().free;
        assert!(db.reserve_free_pages(free + 1, 1, AllocTag::Kernel).is_none());

        // Drain completely, then one more
        let pa = db.reserve_free_pages(free, 1, AllocTag::Kernel).expect("all frames");
        assert!(db.reserve_free_pages(1, 1, AllocTag::Kernel).is_none());
        db.release_pages(pa, free);
    }

    #[test]
    #[should_panic]
    fn double_pfree_panics() {
        let mut db = private_db(8);
        let pa = db.reserve_free_pages(1, 1, AllocTag::Kernel).expect("frame");
        db.release_pages(pa, 1);
        db.release_pages(pa, 1);
    }

    #[test]
    fn aligned_allocation() {
        let align = crate::config::SLAB_UNIT / FRAME_SIZE;
        let mut db = private_db(3 * align);
        let pa = db
            .reserve_free_pages(align, align, AllocTag::Slab)
            .expect("aligned frames");
        assert_eq!(pa % crate::config::SLAB_UNIT, 0);
        db.release_pages(pa, align);
    }

    #[test]
    fn distinct_allocations_do_not_overlap() {
        let mut db = private_db(16);
        let a = db.reserve_free_pages(2, 1, AllocTag::Kernel).unwrap();
        let b = db.reserve_free_pages(2, 1, AllocTag::Kernel).unwrap();
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        assert!(lo + 2 * FRAME_SIZE <= hi);
        db.release_pages(a, 2);
        db.release_pages(b, 2);
    }
}
