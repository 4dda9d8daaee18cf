//! Wait / event layer
//!
//! One queue for everything that sleeps, sorted by absolute wake deadline
//! (ascending; "no deadline" sorts last). Each entry records why its
//! thread sleeps (a timeout, a counting wait object, a futex word, or one
//! of the IPC rendezvous kinds) so wakers match by kind and object.
//!
//! A dedicated kernel worker loops over [`service_expired`], waking every
//! entry whose deadline has elapsed. Wakers running on other CPUs call
//! [`wake_matching`]/[`object_wake`] directly.
//!
//! Lock order is queue before thread: the sleeper inserts its entry and
//! marks itself `Wait` under both locks, so a waker that finds the entry
//! always finds the thread asleep.

pub mod futex;

use crate::collections::{Dict, List};
use crate::hal::{self, PhysAddr};
use crate::metrics::METRICS;
use crate::sync::IrqSpinLock;
use crate::task::{self, ProcessId, ThreadId, ThreadRef, ThreadState, WakeStatus};
use crate::wait_log;

/// Why a thread sleeps, and what can wake it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    /// Pure sleep; only the deadline ends it
    Timeout,
    /// A counting wait object, keyed by owner process and handle
    Object { pid: ProcessId, handle: u64 },
    /// A futex word, identified by the physical address behind it
    Futex { pa: PhysAddr },
    /// An IPC receiver awaiting any message for its process
    IpcReceive { pid: ProcessId },
    /// An IPC sender waiting for a receiver in `dst` to show up
    IpcSend { dst: ProcessId, wants_reply: bool },
    /// A requester waiting for its reply partner
    IpcReply {
        partner: ThreadId,
        partner_pid: ProcessId,
    },
}

/// One sleeping thread
#[derive(Debug, Clone, Copy)]
pub struct WaitEntry {
    pub tid: ThreadId,
    /// The process this wait is charged to (purge key)
    pub owner: ProcessId,
    pub kind: WaitKind,
    /// Absolute wake tick; `u64::MAX` means none
    pub deadline: u64,
}

/// The shared wait queue
static QUEUE: IrqSpinLock<List<WaitEntry>> = IrqSpinLock::new(List::new());

/// Counting wait objects, allocated on first use,
/// keyed by `(pid << 32) | handle`
static OBJECTS: IrqSpinLock<Dict<WaitObject>> = IrqSpinLock::new(Dict::new());

/// A user-visible counting object: `total` signals issued, `count`
/// consumed
struct WaitObject {
    total: u64,
    count: u64,
}

fn object_key(pid: ProcessId, handle: u64) -> u64 {
    (pid << 32) | (handle & 0xFFFF_FFFF)
}

/// Outcome of a wait attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The condition already held; the thread never slept
    Ready,
    /// The thread is asleep on the queue
    Blocked,
    /// The wait target is invalid
    Invalid,
}

/// Number of sleeping threads (diagnostic/stats)
pub fn queue_len() -> usize {
    QUEUE.lock().len()
}

/// Put `thread` to sleep on the queue.
///
/// # Panics
/// Panics unless the thread is `Normal`; sleeping from any other state
/// is an invariant violation.
pub fn sleep_thread(thread: &ThreadRef, kind: WaitKind, deadline: Option<u64>) {
    let deadline = deadline.unwrap_or(u64::MAX);

    // Queue before thread; the waker uses the same order
    let mut q = QUEUE.lock();
    let mut tm = thread.lock();
    if tm.state != ThreadState::Normal {
        panic!(
            "[WAIT] sleep of thread {} in state {:?}",
            thread.id, tm.state
        );
    }
    tm.state = ThreadState::Wait;
    tm.wake_status = WakeStatus::None;

    q.insert_sorted(
        WaitEntry {
            tid: thread.id,
            owner: thread.pid,
            kind,
            deadline,
        },
        |a, b| a.deadline.cmp(&b.deadline),
    );
}

/// Wake a sleeping thread directly: `Wait → Normal`, back to the
/// scheduler, wake status recorded. A `Failed` status also releases any
/// IPC cross-references the sleeper held. The caller must already have
/// removed (or never created) the thread's queue entry.
pub(crate) fn wake_thread(thread: &ThreadRef, status: WakeStatus) -> bool {
    let peers = {
        let mut tm = thread.lock();
        if tm.state != ThreadState::Wait {
            return false;
        }
        tm.state = ThreadState::Normal;
        tm.wake_status = status;

        // The sleeper parked inside a syscall; patch its saved context so
        // it resumes seeing how the wait ended
        let code = match status {
            WakeStatus::Ok | WakeStatus::None => 0,
            WakeStatus::TimedOut => crate::sys::syscall::STATUS_TIMED_OUT,
            WakeStatus::Failed => crate::sys::syscall::STATUS_WAIT_FAILED,
        };
        hal::hal().set_syscall_return(&mut tm.ctx, code, 0, 0);

        let peers = if status == WakeStatus::Failed {
            (tm.ipc_wait.take(), tm.ipc_reply_to.take())
        } else {
            (None, None)
        };
        crate::sched::put(thread, &mut tm);
        peers
    };
    drop(peers);

    METRICS.inc_wakeups();
    true
}

/// Wake the thread behind a removed entry
fn wake_entry(entry: WaitEntry, status: WakeStatus) -> bool {
    let thread = match task::acquire_thread(entry.tid) {
        Some(t) => t,
        None => return false,
    };
    wake_thread(&thread, status)
}

/// Wake up to `max` sleepers matching `pred`. Returns the number woken.
pub fn wake_matching<F>(mut pred: F, max: usize, status: WakeStatus) -> usize
where
    F: FnMut(&WaitEntry) -> bool,
{
    let mut woken = 0;
    while woken < max {
        let entry = QUEUE.lock().remove_first(|e| pred(e));
        match entry {
            Some(e) => {
                if wake_entry(e, status) {
                    woken += 1;
                }
            }
            None => break,
        }
    }
    woken
}

/// Wake sleepers of the wait object `(pid, handle)`
pub fn wake_on_object(pid: ProcessId, handle: u64, max: usize) -> usize {
    wake_matching(
        |e| e.kind == WaitKind::Object { pid, handle },
        max,
        WakeStatus::Ok,
    )
}

/// Pop and wake every entry whose deadline has elapsed. The timeout
/// worker's loop body; also callable opportunistically.
pub fn service_expired() -> usize {
    let now = hal::hal().now_ticks();
    let mut woken = 0;

    loop {
        let entry = {
            let mut q = QUEUE.lock();
            let expired = q.front().map(|e| e.deadline <= now).unwrap_or(false);
            if expired {
                q.pop_front()
            } else {
                None
            }
        };
        match entry {
            Some(e) => {
                if wake_entry(e, WakeStatus::TimedOut) {
                    woken += 1;
                }
            }
            None => break,
        }
    }
    woken
}

/// Forcibly wake everything waiting on behalf of `pid`: its own sleepers
/// and foreign threads blocked toward it. Their IPC cross-references are
/// dropped and they observe a failed wait. Also discards the process's
/// wait objects.
pub fn purge_process(pid: ProcessId) -> usize {
    let woken = wake_matching(
        |e| {
            e.owner == pid
                || match e.kind {
                    WaitKind::IpcSend { dst, .. } => dst == pid,
                    WaitKind::IpcReply { partner_pid, .. } => partner_pid == pid,
                    _ => false,
                }
        },
        usize::MAX,
        WakeStatus::Failed,
    );

    OBJECTS
        .lock()
        .remove_when(|key, _| (key >> 32) == pid, |_, _| {});

    if woken > 0 {
        wait_log!("purged {} waiters of process {}", woken, pid);
    }
    woken
}

/// The timeout worker body: a kernel thread loops here forever, draining
/// expired waits and reaping exited kernel threads.
pub fn timeout_worker() -> ! {
    wait_log!("timeout worker up");
    loop {
        service_expired();
        task::reap();
        hal::hal().wait_for_event();
    }
}

// ---------------------------------------------------------------------------
// Counting wait objects
// ---------------------------------------------------------------------------

/// Wait on the counting object `handle` of the calling thread's process.
///
/// Consumes a pending signal immediately when one exists; otherwise the
/// thread sleeps until [`object_wake`] supplies one or the deadline
/// passes. The object is allocated on first use.
pub fn object_wait(thread: &ThreadRef, handle: u64, deadline: Option<u64>) -> WaitOutcome {
    let pid = thread.pid;
    {
        let mut objs = OBJECTS.lock();
        let key = object_key(pid, handle);
        if objs.get(key).is_none() {
            objs.insert(key, WaitObject { total: 0, count: 0 })
                .expect("[WAIT] object insert raced");
        }
        let obj = objs.get_mut(key).unwrap();
        if obj.count < obj.total {
            obj.count += 1;
            return WaitOutcome::Ready;
        }
    }

    sleep_thread(thread, WaitKind::Object { pid, handle }, deadline);
    WaitOutcome::Blocked
}

/// Add `n` signals to the object and wake up to `n` of its sleepers.
/// Signals not consumed by a woken thread remain for future fast-path
/// waits. Returns the number woken.
pub fn object_wake(pid: ProcessId, handle: u64, n: usize) -> usize {
    {
        let mut objs = OBJECTS.lock();
        let key = object_key(pid, handle);
        if objs.get(key).is_none() {
            objs.insert(key, WaitObject { total: 0, count: 0 })
                .expect("[WAIT] object insert raced");
        }
        objs.get_mut(key).unwrap().total += n as u64;
    }

    let woken = wake_on_object(pid, handle, n);
    if woken > 0 {
        let mut objs = OBJECTS.lock();
        if let Some(obj) = objs.get_mut(object_key(pid, handle)) {
            obj.count += woken as u64;
        }
    }
    woken
}

// ---------------------------------------------------------------------------
// Queue surgery for the IPC layer
// ---------------------------------------------------------------------------

/// Remove the longest-waiting receiver for `pid`, if any
pub(crate) fn take_receiver(pid: ProcessId) -> Option<WaitEntry> {
    QUEUE
        .lock()
        .remove_first(|e| e.kind == WaitKind::IpcReceive { pid })
}

/// Remove the longest-waiting sender targeting `pid`, if any
pub(crate) fn take_sender(dst: ProcessId) -> Option<WaitEntry> {
    QUEUE
        .lock()
        .remove_first(|e| matches!(e.kind, WaitKind::IpcSend { dst: d, .. } if d == dst))
}

/// Re-insert a removed entry under a new kind, the thread staying asleep
/// throughout (a matched sender converting into a reply-waiter)
pub(crate) fn resleep_as(mut entry: WaitEntry, kind: WaitKind) {
    entry.kind = kind;
    QUEUE
        .lock()
        .insert_sorted(entry, |a, b| a.deadline.cmp(&b.deadline));
}

/// Remove the entry of a specific sleeping thread and wake it
pub(crate) fn wake_tid(tid: ThreadId, status: WakeStatus) -> bool {
    let entry = QUEUE.lock().remove_first(|e| e.tid == tid);
    match entry {
        Some(e) => wake_entry(e, status),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, set_cpu, spawn_test_thread};

    #[test]
    fn deadline_ordering_drains_ascending() {
        testutil::boot();
        set_cpu(0);

        let proc = testutil::test_process("wait-order");
        // Deadlines [5, 1, 3] must drain as 1, 3, 5
        let t5 = spawn_test_thread(&proc);
        let t1 = spawn_test_thread(&proc);
        let t3 = spawn_test_thread(&proc);

        let base = hal::hal().now_ticks();
        sleep_thread(&t5, WaitKind::Timeout, Some(base + 5));
        sleep_thread(&t1, WaitKind::Timeout, Some(base + 1));
        sleep_thread(&t3, WaitKind::Timeout, Some(base + 3));

        let mut order = std::vec::Vec::new();
        for advance in [1u64, 2, 2] {
            testutil::advance_ticks(advance);
            service_expired();
            for t in [&t1, &t3, &t5] {
                if t.lock().state == ThreadState::Normal && !order.contains(&t.id) {
                    order.push(t.id);
                }
            }
        }
        assert_eq!(order, [t1.id, t3.id, t5.id]);
        for t in [t1, t3, t5] {
            assert_eq!(t.lock().wake_status, WakeStatus::TimedOut);
            testutil::retire_test_thread(t);
        }
    }

    #[test]
    fn object_wait_wake_counts() {
        testutil::boot();
        set_cpu(0);

        let proc = testutil::test_process("wait-obj");
        let waiter = spawn_test_thread(&proc);
        let handle = 0x33;

        // No signal yet: blocks
        assert_eq!(object_wait(&waiter, handle, None), WaitOutcome::Blocked);
        assert_eq!(waiter.lock().state, ThreadState::Wait);

        // One signal: exactly the one sleeper wakes
        assert_eq!(object_wake(proc.id, handle, 1), 1);
        assert_eq!(waiter.lock().state, ThreadState::Normal);
        assert_eq!(waiter.lock().wake_status, WakeStatus::Ok);

        // A banked signal satisfies the next wait without sleeping
        object_wake(proc.id, handle, 1);
        assert_eq!(object_wait(&waiter, handle, None), WaitOutcome::Ready);

        testutil::retire_test_thread(waiter);
    }

    #[test]
    fn wake_respects_max_count() {
        testutil::boot();
        set_cpu(0);

        let proc = testutil::test_process("wait-max");
        let handle = 0x44;
        let threads: std::vec::Vec<_> = (0..3).map(|_| spawn_test_thread(&proc)).collect();
        for t in &threads {
            assert_eq!(object_wait(t, handle, None), WaitOutcome::Blocked);
        }

        assert_eq!(object_wake(proc.id, handle, 2), 2);
        let awake = threads
            .iter()
            .filter(|t| t.lock().state == ThreadState::Normal)
            .count();
        assert_eq!(awake, 2);

        // Wake the straggler so teardown is clean
        assert_eq!(object_wake(proc.id, handle, 1), 1);
        for t in threads {
            testutil::retire_test_thread(t);
        }
    }

    #[test]
    fn purge_wakes_with_failure() {
        testutil::boot();
        set_cpu(0);

        let dying = testutil::test_process("wait-dying");
        let other = testutil::test_process("wait-other");

        // One sleeper of the dying process, one foreign sender toward it
        let own = spawn_test_thread(&dying);
        sleep_thread(&own, WaitKind::Timeout, None);

        let foreign = spawn_test_thread(&other);
        sleep_thread(
            &foreign,
            WaitKind::IpcSend {
                dst: dying.id,
                wants_reply: false,
            },
            None,
        );

        assert_eq!(purge_process(dying.id), 2);
        assert_eq!(own.lock().wake_status, WakeStatus::Failed);
        assert_eq!(foreign.lock().wake_status, WakeStatus::Failed);

        testutil::retire_test_thread(own);
        testutil::retire_test_thread(foreign);
    }
}
