//! Kernel logging macros
//!
//! Every subsystem logs through a macro family with a consistent `[SUBSYS]`
//! prefix. The macros forward to the `log` facade; the embedding binary
//! installs whatever sink it owns (UART, ring buffer, host stderr in tests).

/// Log general scheduler information
#[macro_export]
macro_rules! sched_log {
    ($($arg:tt)*) => {
        log::debug!("[SCHED] {}", format_args!($($arg)*))
    };
}

/// Log scheduler warnings
#[macro_export]
macro_rules! sched_warn {
    ($($arg:tt)*) => {
        log::warn!("[SCHED] WARNING: {}", format_args!($($arg)*))
    };
}

/// Log scheduler errors
#[macro_export]
macro_rules! sched_error {
    ($($arg:tt)*) => {
        log::error!("[SCHED] ERROR: {}", format_args!($($arg)*))
    };
}

/// Log general memory-management information
#[macro_export]
macro_rules! mm_log {
    ($($arg:tt)*) => {
        log::debug!("[MM] {}", format_args!($($arg)*))
    };
}

/// Log memory-management warnings
#[macro_export]
macro_rules! mm_warn {
    ($($arg:tt)*) => {
        log::warn!("[MM] WARNING: {}", format_args!($($arg)*))
    };
}

/// Log general task-management information
#[macro_export]
macro_rules! task_log {
    ($($arg:tt)*) => {
        log::debug!("[TASK] {}", format_args!($($arg)*))
    };
}

/// Log task-management warnings
#[macro_export]
macro_rules! task_warn {
    ($($arg:tt)*) => {
        log::warn!("[TASK] WARNING: {}", format_args!($($arg)*))
    };
}

/// Log general IPC information
#[macro_export]
macro_rules! ipc_log {
    ($($arg:tt)*) => {
        log::debug!("[IPC] {}", format_args!($($arg)*))
    };
}

/// Log general wait-layer information
#[macro_export]
macro_rules! wait_log {
    ($($arg:tt)*) => {
        log::debug!("[WAIT] {}", format_args!($($arg)*))
    };
}

/// Log syscall-dispatch information
#[macro_export]
macro_rules! sys_log {
    ($($arg:tt)*) => {
        log::debug!("[SYSCALL] {}", format_args!($($arg)*))
    };
}

/// Log TLB shootdown information
#[macro_export]
macro_rules! tlb_log {
    ($($arg:tt)*) => {
        log::debug!("[TLB] {}", format_args!($($arg)*))
    };
}

/// Log TLB shootdown warnings
#[macro_export]
macro_rules! tlb_warn {
    ($($arg:tt)*) => {
        log::warn!("[TLB] WARNING: {}", format_args!($($arg)*))
    };
}
