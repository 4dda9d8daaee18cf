//! Kernel statistics snapshot
//!
//! `SYSCALL_STATS_KERNEL` fills a caller-supplied buffer with this
//! structure: a read-only diagnostic snapshot of uptime, population
//! counts, IPC and shootdown activity, the physical memory layout, and
//! per-slab-class allocator counters. The layout is `#[repr(C)]` and
//! shared with the user-mode library.

use core::sync::atomic::Ordering;

use crate::hal;
use crate::metrics::METRICS;
use crate::mm::{allocator, pfn, slab, tlb};
use crate::{sched, task, wait};

/// Slab classes reported in the snapshot
pub const STATS_SLAB_SLOTS: usize = slab::MAX_SLAB_CLASSES;

/// One slab cache's counters
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct SlabClassStats {
    pub block_size: u64,
    pub allocs: u64,
    pub frees: u64,
    pub buckets: u64,
}

/// The exported snapshot
#[repr(C)]
pub struct KernelStats {
    pub uptime_ticks: u64,
    pub processes: u64,
    pub threads: u64,
    pub waiters: u64,
    pub ready: u64,
    pub syscalls: u64,
    pub context_switches: u64,
    pub wakeups: u64,
    pub ipc_sent: u64,
    pub ipc_received: u64,
    pub tlb_requests: u64,
    pub tlb_sequence: u64,
    pub tlb_pending: u64,
    pub phys_base: u64,
    pub phys_limit: u64,
    pub pfn_entries: u64,
    pub pages_total: u64,
    pub pages_free: u64,
    pub heap_allocated: u64,
    pub slab_classes: u64,
    pub slab: [SlabClassStats; STATS_SLAB_SLOTS],
}

/// Assemble the snapshot
pub fn capture() -> KernelStats {
    let usage = pfn::usage();
    let (tlb_requests, tlb_sequence) = tlb::stats();

    let mut slab_stats = [SlabClassStats::default(); STATS_SLAB_SLOTS];
    let mut classes = 0usize;
    slab::for_each_registered(|cache| {
        if classes < STATS_SLAB_SLOTS {
            let s = cache.stats();
            slab_stats[classes] = SlabClassStats {
                block_size: s.block_size as u64,
                allocs: s.allocs,
                frees: s.frees,
                buckets: s.buckets as u64,
            };
            classes += 1;
        }
    });

    KernelStats {
        uptime_ticks: hal::hal().now_ticks(),
        processes: task::process_count(),
        threads: task::thread_count(),
        waiters: wait::queue_len() as u64,
        ready: sched::ready_len() as u64,
        syscalls: METRICS.syscalls.load(Ordering::Relaxed),
        context_switches: METRICS.context_switches.load(Ordering::Relaxed),
        wakeups: METRICS.wakeups.load(Ordering::Relaxed),
        ipc_sent: METRICS.ipc_messages_sent.load(Ordering::Relaxed),
        ipc_received: METRICS.ipc_messages_received.load(Ordering::Relaxed),
        tlb_requests,
        tlb_sequence,
        tlb_pending: tlb::pending() as u64,
        phys_base: usage.phys_base as u64,
        phys_limit: usage.phys_limit as u64,
        pfn_entries: usage.entries as u64,
        pages_total: usage.total_usable as u64,
        pages_free: usage.free as u64,
        heap_allocated: allocator::allocated_bytes() as u64,
        slab_classes: classes as u64,
        slab: slab_stats,
    }
}
