/// Configuration constants for the Mica kernel core

/// Maximum number of CPUs supported by the kernel
pub const MAX_CPUS: usize = 16;

/// Scheduler tick frequency in Hz (100 Hz = 10ms per tick)
pub const SCHED_HZ: u64 = 100;

/// Size of a physical frame (4KB page)
pub const FRAME_SIZE: usize = 4096;

/// Allocation unit handed to the slab allocator: one bucket spans this many
/// bytes and is aligned to it, so a block pointer locates its bucket header
/// by masking
pub const SLAB_UNIT: usize = 64 * 1024;

/// Bounded idle spin iterations before the scheduler re-checks the ready
/// queue for work
pub const SCHED_IDLE_SPIN: usize = 1024;

/// Minimum bucket count a dict will shrink down to
pub const DICT_MIN_BUCKETS: usize = 8;

/// Number of address-space identifiers handed out by the ASID allocator
pub const ASID_COUNT: usize = 4096;

// ---------------------------------------------------------------------------
// Thread memory block geometry
//
// Every thread owns one contiguous block holding its stack, TLS and the two
// message buffers at fixed offsets. The message buffers are page-aligned so
// a user block needs exactly one translation per buffer.
// ---------------------------------------------------------------------------

/// Total size of a thread's memory block
pub const THREAD_BLOCK_SIZE: usize = 64 * 1024;

/// Offset of the stack within the thread block (stack grows down from
/// `TB_STACK_OFF + TB_STACK_SIZE`)
pub const TB_STACK_OFF: usize = 0;

/// Stack size within the thread block
pub const TB_STACK_SIZE: usize = 48 * 1024;

/// Offset of thread-local storage within the thread block
pub const TB_TLS_OFF: usize = 48 * 1024;

/// Thread-local storage size
pub const TB_TLS_SIZE: usize = 4 * 1024;

/// Offset of the message send buffer within the thread block
pub const TB_MSG_SEND_OFF: usize = 52 * 1024;

/// Offset of the message receive buffer within the thread block
pub const TB_MSG_RECV_OFF: usize = 56 * 1024;

/// Size of each message buffer (one message exactly)
pub const TB_MSG_BUF_SIZE: usize = 4 * 1024;

// ---------------------------------------------------------------------------
// User virtual-memory window
// ---------------------------------------------------------------------------

/// Base of the per-process user VM allocation window
pub const USER_VM_BASE: usize = 0x0000_0000_4000_0000;

/// Exclusive top of the per-process user VM allocation window (512GB)
pub const USER_VM_TOP: usize = 0x0000_8000_0000_0000;
