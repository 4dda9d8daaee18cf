//! Kernel metrics collection
//!
//! Tracks system-wide statistics using atomic counters for SMP safety.
//! The counters feed the `SYSCALL_STATS_KERNEL` snapshot.

use core::sync::atomic::{AtomicU64, Ordering};

/// Number of syscall opcodes tracked individually
pub const MAX_SYSCALLS: usize = 32;

/// Global system metrics
pub struct SystemMetrics {
    /// Total context switches across all CPUs
    pub context_switches: AtomicU64,

    /// Per-syscall counters (indexed by syscall number)
    pub syscalls: AtomicU64,

    /// Per-opcode syscall counters
    pub syscalls_by_no: [AtomicU64; MAX_SYSCALLS],

    /// Total IPC messages sent
    pub ipc_messages_sent: AtomicU64,

    /// Total IPC messages received
    pub ipc_messages_received: AtomicU64,

    /// Threads woken by the wait layer
    pub wakeups: AtomicU64,

    /// TLB shootdown requests issued
    pub tlb_shootdowns: AtomicU64,
}

impl SystemMetrics {
    /// Create a new SystemMetrics instance with all counters at zero
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            context_switches: AtomicU64::new(0),
            syscalls: AtomicU64::new(0),
            syscalls_by_no: [ZERO; MAX_SYSCALLS],
            ipc_messages_sent: AtomicU64::new(0),
            ipc_messages_received: AtomicU64::new(0),
            wakeups: AtomicU64::new(0),
            tlb_shootdowns: AtomicU64::new(0),
        }
    }

    /// Increment context switch counter
    #[inline]
    pub fn inc_context_switches(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment syscall counters for `no`
    #[inline]
    pub fn inc_syscall(&self, no: usize) {
        self.syscalls.fetch_add(1, Ordering::Relaxed);
        if no < MAX_SYSCALLS {
            self.syscalls_by_no[no].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Increment IPC sent counter
    #[inline]
    pub fn inc_ipc_sent(&self) {
        self.ipc_messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment IPC received counter
    #[inline]
    pub fn inc_ipc_received(&self) {
        self.ipc_messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment wakeup counter
    #[inline]
    pub fn inc_wakeups(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment TLB shootdown counter
    #[inline]
    pub fn inc_tlb_shootdowns(&self) {
        self.tlb_shootdowns.fetch_add(1, Ordering::Relaxed);
    }
}

/// Global metrics instance
pub static METRICS: SystemMetrics = SystemMetrics::new();
