//! Per-process virtual-memory block allocator
//!
//! Each process owns four sorted block lists that together describe its VM
//! window. A block lives in exactly one of them at a time:
//!
//! - `avail_unmapped`: free space, coalesced, address-sorted
//! - `inuse_mapped`: allocated and mapped
//! - `sanit_mapped`: unmap requested, waiting for every CPU's TLB ack
//! - `sanit_unmapped`: acknowledged everywhere, ready to merge back
//!
//! plus a bounded `reuse_mapped` list (sized to the CPU count) that keeps
//! recently-freed thread-stack blocks mapped for cheap reuse.
//!
//! Invariant: address ranges across `avail_unmapped` and `inuse_mapped`
//! never overlap and stay sorted by base, which is what lets adjacent free
//! blocks coalesce on insert.
//!
//! The lists here are pure metadata. Page-table edits, frame ownership and
//! the cross-CPU acknowledgement protocol are driven by the task layer and
//! `mm::tlb`; freeing is two-phase precisely because a remote CPU may hold
//! a stale translation until it acknowledges (see the module docs of
//! `mm::tlb`).

use crate::collections::List;
use crate::config::FRAME_SIZE;
use crate::hal::VirtAddr;

/// VM allocation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No free block can satisfy the request
    NoSpace,
    /// Address is outside the window or not frame-aligned
    BadAddress,
    /// No allocated block starts at the given address
    NotAllocated,
    /// The exact-address range is (partially) occupied
    Occupied,
}

/// Result type for VM operations
pub type VmResult<T> = Result<T, VmError>;

/// What a block is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmBlockKind {
    /// Free space in `avail_unmapped`
    Free,
    /// Ordinary allocation
    Generic,
    /// A thread's stack/TLS/message block (eligible for the reuse list)
    ThreadStack,
}

/// One contiguous extent of a process's VM window
#[derive(Debug, Clone, Copy)]
pub struct VmBlock {
    pub base: VirtAddr,
    pub size: usize,
    pub kind: VmBlockKind,
    /// Whether the backing frames belong to this block (false for device
    /// and cross-process mappings, whose frames have another owner)
    pub owns_frames: bool,
    /// Shootdown sequence number; meaningful only while the block is in a
    /// `sanit_*` list
    pub shoot_seq: u64,
}

impl VmBlock {
    fn end(&self) -> VirtAddr {
        self.base + self.size
    }
}

fn by_base(a: &VmBlock, b: &VmBlock) -> core::cmp::Ordering {
    a.base.cmp(&b.base)
}

/// Absorb `right` into `left` when the extents touch
fn merge_adjacent(left: &mut VmBlock, right: &VmBlock) -> bool {
    if left.end() == right.base {
        left.size += right.size;
        return true;
    }
    false
}

/// The four lifecycle lists plus the thread-stack reuse list
pub struct VmSpace {
    window_base: VirtAddr,
    window_top: VirtAddr,
    avail_unmapped: List<VmBlock>,
    inuse_mapped: List<VmBlock>,
    sanit_mapped: List<VmBlock>,
    sanit_unmapped: List<VmBlock>,
    reuse_mapped: List<VmBlock>,
}

impl VmSpace {
    /// A space whose window `[base, top)` is entirely free
    pub fn new(base: VirtAddr, top: VirtAddr) -> Self {
        let mut space = VmSpace {
            window_base: base,
            window_top: top,
            avail_unmapped: List::new(),
            inuse_mapped: List::new(),
            sanit_mapped: List::new(),
            sanit_unmapped: List::new(),
            reuse_mapped: List::new(),
        };
        if top > base {
            space.avail_unmapped.push_back(VmBlock {
                base,
                size: top - base,
                kind: VmBlockKind::Free,
                owns_frames: true,
                shoot_seq: 0,
            });
        }
        space
    }

    /// An empty space for processes that never allocate user VM
    pub fn empty() -> Self {
        Self::new(0, 0)
    }

    /// Allocate `size` bytes, either anywhere (`at == None`) or exactly at
    /// the given base. Returns the block base.
    pub fn alloc(
        &mut self,
        size: usize,
        at: Option<VirtAddr>,
        kind: VmBlockKind,
        owns_frames: bool,
    ) -> VmResult<VirtAddr> {
        if size == 0 {
            return Err(VmError::BadAddress);
        }
        let size = (size + FRAME_SIZE - 1) & !(FRAME_SIZE - 1);

        let base = match at {
            None => self.carve_first_fit(size)?,
            Some(addr) => {
                if addr % FRAME_SIZE != 0
                    || addr < self.window_base
                    || addr + size > self.window_top
                {
                    return Err(VmError::BadAddress);
                }
                self.carve_exact(addr, size)?
            }
        };

        self.inuse_mapped.insert_sorted(
            VmBlock {
                base,
                size,
                kind,
                owns_frames,
                shoot_seq: 0,
            },
            by_base,
        );
        Ok(base)
    }

    /// Take `size` bytes from the front of the first free block that fits
    fn carve_first_fit(&mut self, size: usize) -> VmResult<VirtAddr> {
        let mut base = None;
        for block in self.avail_unmapped.iter_mut() {
            if block.size >= size {
                base = Some(block.base);
                block.base += size;
                block.size -= size;
                break;
            }
        }
        let base = base.ok_or(VmError::NoSpace)?;
        self.drop_empty_avail();
        Ok(base)
    }

    /// Split `[addr, addr + size)` out of the free block containing it
    fn carve_exact(&mut self, addr: VirtAddr, size: usize) -> VmResult<VirtAddr> {
        let mut suffix = None;
        let mut found = false;

        for block in self.avail_unmapped.iter_mut() {
            if block.base <= addr && addr + size <= block.end() {
                let tail = block.end() - (addr + size);
                if tail > 0 {
                    suffix = Some(VmBlock {
                        base: addr + size,
                        size: tail,
                        kind: VmBlockKind::Free,
                        owns_frames: true,
                        shoot_seq: 0,
                    });
                }
                // Donor keeps the prefix
                block.size = addr - block.base;
                found = true;
                break;
            }
            if block.base > addr {
                break;
            }
        }

        if !found {
            return Err(VmError::Occupied);
        }
        if let Some(suffix) = suffix {
            self.avail_unmapped.insert_sorted(suffix, by_base);
        }
        self.drop_empty_avail();
        Ok(addr)
    }

    fn drop_empty_avail(&mut self) {
        while self.avail_unmapped.remove_first(|b| b.size == 0).is_some() {}
    }

    /// Remove the allocated block starting at `base` without staging it
    /// for reclamation; the caller decides its fate (reuse list or the
    /// two-phase free).
    pub fn take_inuse(&mut self, base: VirtAddr) -> Option<VmBlock> {
        self.inuse_mapped.remove_first(|b| b.base == base)
    }

    /// Re-account a still-mapped block (from the reuse list) as in use
    pub fn put_inuse(&mut self, block: VmBlock) {
        self.inuse_mapped.insert_sorted(block, by_base);
    }

    /// Remove any allocated block (teardown path)
    pub fn take_any_inuse(&mut self) -> Option<VmBlock> {
        self.inuse_mapped.pop_front()
    }

    /// Park a block whose translations were detached, pending TLB acks
    pub fn put_sanit_mapped(&mut self, block: VmBlock) {
        self.sanit_mapped.insert_sorted(block, by_base);
    }

    /// Back out an allocation whose pages were never exposed to any CPU
    /// (creation-failure unwind). Nothing was mapped, so the extent goes
    /// straight back to the free list without a shootdown.
    pub fn unwind_alloc(&mut self, base: VirtAddr) {
        if let Some(mut block) = self.take_inuse(base) {
            block.kind = VmBlockKind::Free;
            block.owns_frames = true;
            self.avail_unmapped
                .insert_merge_sorted(block, by_base, merge_adjacent);
        }
    }

    /// Stage 1 of freeing: move the block starting at `base` from
    /// `inuse_mapped` to `sanit_mapped`, stamped with the shootdown
    /// sequence number the caller allocated.
    pub fn start_free(&mut self, base: VirtAddr, seq: u64) -> VmResult<VmBlock> {
        let mut block = self
            .inuse_mapped
            .remove_first(|b| b.base == base)
            .ok_or(VmError::NotAllocated)?;
        block.shoot_seq = seq;
        self.sanit_mapped.insert_sorted(block, by_base);
        Ok(block)
    }

    /// Stage 2: every CPU has acknowledged `seq`; the block moves to
    /// `sanit_unmapped`.
    pub fn finish_free(&mut self, seq: u64) -> Option<VmBlock> {
        let block = self.sanit_mapped.remove_first(|b| b.shoot_seq == seq)?;
        self.sanit_unmapped.insert_sorted(block, by_base);
        Some(block)
    }

    /// Merge every acknowledged block back into the free list, coalescing
    /// with its neighbours.
    pub fn merge_reclaimed(&mut self) {
        while let Some(mut block) = self.sanit_unmapped.pop_front() {
            block.kind = VmBlockKind::Free;
            block.owns_frames = true;
            block.shoot_seq = 0;
            self.avail_unmapped
                .insert_merge_sorted(block, by_base, merge_adjacent);
        }
    }

    /// Pop a still-mapped thread-stack block for reuse
    pub fn take_reuse(&mut self) -> Option<VmBlock> {
        self.reuse_mapped.pop_front()
    }

    /// Park a freed thread-stack block for reuse. The list is bounded by
    /// `limit` (the CPU count); a full list hands the block back for the
    /// normal two-phase free.
    pub fn put_reuse(&mut self, block: VmBlock, limit: usize) -> Option<VmBlock> {
        if self.reuse_mapped.len() >= limit {
            return Some(block);
        }
        self.reuse_mapped.push_back(block);
        None
    }

    /// Look up the allocated block starting at `base`
    pub fn find_inuse(&self, base: VirtAddr) -> Option<VmBlock> {
        self.inuse_mapped.iter().find(|b| b.base == base).copied()
    }

    /// The free extent containing `addr`, if any
    pub fn find_avail(&self, addr: VirtAddr) -> Option<VmBlock> {
        self.avail_unmapped
            .iter()
            .find(|b| b.base <= addr && addr < b.end())
            .copied()
    }

    /// (avail, inuse, sanit_mapped, sanit_unmapped, reuse) list lengths
    pub fn census(&self) -> (usize, usize, usize, usize, usize) {
        (
            self.avail_unmapped.len(),
            self.inuse_mapped.len(),
            self.sanit_mapped.len(),
            self.sanit_unmapped.len(),
            self.reuse_mapped.len(),
        )
    }

    /// Verify sortedness and non-overlap across `avail_unmapped` and
    /// `inuse_mapped`.
    ///
    /// # Panics
    /// Panics on violation; the lists being inconsistent is a kernel bug.
    pub fn check_invariants(&self) {
        for list in [&self.avail_unmapped, &self.inuse_mapped] {
            let mut prev_end = 0;
            for block in list.iter() {
                if block.base < prev_end {
                    panic!("[VM] block list unsorted or overlapping at {:#x}", block.base);
                }
                prev_end = block.end();
            }
        }

        // Cross-list overlap: walk inuse against avail
        for used in self.inuse_mapped.iter() {
            for free in self.avail_unmapped.iter() {
                if used.base < free.end() && free.base < used.end() {
                    panic!(
                        "[VM] allocated block {:#x} overlaps free space {:#x}",
                        used.base, free.base
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    const BASE: usize = 0x4000_0000;
    const TOP: usize = 0x4010_0000; // 1 MiB window

    fn space() -> VmSpace {
        testutil::boot();
        VmSpace::new(BASE, TOP)
    }

    #[test]
    fn first_fit_and_exact() {
        let mut vm = space();
        let a = vm.alloc(0x4000, None, VmBlockKind::Generic, true).unwrap();
        assert_eq!(a, BASE);

        // Exact allocation in the middle splits the donor
        let want = BASE + 0x20000;
        let b = vm
            .alloc(0x2000, Some(want), VmBlockKind::Generic, true)
            .unwrap();
        assert_eq!(b, want);
        vm.check_invariants();

        // The hole between a and b is still allocatable
        let c = vm.alloc(0x1000, None, VmBlockKind::Generic, true).unwrap();
        assert_eq!(c, BASE + 0x4000);
        vm.check_invariants();
    }

    #[test]
    fn exact_rejects_occupied() {
        let mut vm = space();
        let a = vm.alloc(0x4000, None, VmBlockKind::Generic, true).unwrap();
        assert_eq!(
            vm.alloc(0x1000, Some(a), VmBlockKind::Generic, true),
            Err(VmError::Occupied)
        );
        assert_eq!(
            vm.alloc(0x1000, Some(a + 123), VmBlockKind::Generic, true),
            Err(VmError::BadAddress)
        );
    }

    #[test]
    fn no_space_is_an_error() {
        let mut vm = space();
        assert_eq!(
            vm.alloc(TOP - BASE + FRAME_SIZE, None, VmBlockKind::Generic, true),
            Err(VmError::NoSpace)
        );
    }

    #[test]
    fn two_phase_free_coalesces_back() {
        let mut vm = space();
        let size = 0x8000;
        let a = vm.alloc(size, None, VmBlockKind::Generic, true).unwrap();

        // Stage 1: unmap requested
        vm.start_free(a, 7).unwrap();
        let (_, inuse, sanit_m, sanit_u, _) = vm.census();
        assert_eq!((inuse, sanit_m, sanit_u), (0, 1, 0));
        // Not yet free space: the extent is still in quarantine
        assert!(vm.find_avail(a).is_none());

        // Stage 2: all CPUs acknowledged
        vm.finish_free(7).unwrap();
        let (_, _, sanit_m, sanit_u, _) = vm.census();
        assert_eq!((sanit_m, sanit_u), (0, 1));

        vm.merge_reclaimed();
        vm.check_invariants();

        // Round-trip identity: one extent covering the whole window again
        let free = vm.find_avail(a).expect("extent back in free list");
        assert_eq!(free.base, BASE);
        assert_eq!(free.size, TOP - BASE);
        let (avail, ..) = vm.census();
        assert_eq!(avail, 1);
    }

    #[test]
    fn coalescing_bridges_neighbours() {
        let mut vm = space();
        let a = vm.alloc(0x1000, None, VmBlockKind::Generic, true).unwrap();
        let b = vm.alloc(0x1000, None, VmBlockKind::Generic, true).unwrap();
        let c = vm.alloc(0x1000, None, VmBlockKind::Generic, true).unwrap();

        // Free outer two first: two separate reclaimed extents
        for (base, seq) in [(a, 1u64), (c, 2)] {
            vm.start_free(base, seq).unwrap();
            vm.finish_free(seq).unwrap();
        }
        vm.merge_reclaimed();
        let (avail, ..) = vm.census();
        assert_eq!(avail, 2); // [a] and [c..top]

        // Freeing the middle bridges everything into one extent
        vm.start_free(b, 3).unwrap();
        vm.finish_free(3).unwrap();
        vm.merge_reclaimed();
        let (avail, ..) = vm.census();
        assert_eq!(avail, 1);
        assert_eq!(vm.find_avail(BASE).unwrap().size, TOP - BASE);
    }

    #[test]
    fn reuse_list_is_bounded() {
        let mut vm = space();
        let limit = 2;
        let mut blocks = std::vec::Vec::new();
        for _ in 0..3 {
            let base = vm
                .alloc(0x10000, None, VmBlockKind::ThreadStack, true)
                .unwrap();
            blocks.push(vm.start_free(base, 0).unwrap());
            // Thread stacks skip shootdown while the reuse list has room;
            // simulate the task layer's routing
            let block = vm.sanit_mapped.remove_first(|_| true).unwrap();
            if let Some(overflow) = vm.put_reuse(block, limit) {
                vm.sanit_mapped.insert_sorted(overflow, by_base);
            }
        }
        let (_, _, sanit_m, _, reuse) = vm.census();
        assert_eq!(reuse, limit);
        assert_eq!(sanit_m, 1);

        // Reuse pops in FIFO order
        let reused = vm.take_reuse().unwrap();
        assert_eq!(reused.kind, VmBlockKind::ThreadStack);
    }
}
