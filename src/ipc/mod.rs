//! Inter-process messaging
//!
//! Every message is a fixed-capacity structure (a small parameter array
//! filled in insertion order plus a variable-length data blob) copied
//! verbatim between the sender's thread-local send buffer and the
//! receiver's thread-local receive buffer. The kernel stamps the sender's
//! identity; user space cannot forge it. The layout is `#[repr(C)]` and
//! bit-compatible with the user-mode library.
//!
//! Three delivery modes:
//!
//! - **Popup**: spawn a fresh thread in the destination process at its
//!   registered popup entry, with the opcode as start parameter, and copy
//!   the message into the new thread's receive buffer.
//! - **Serial**: match the sender with a receiver already blocked in
//!   [`receive`], FIFO per destination process; an unmatched sender
//!   blocks until a receiver arrives.
//! - **Request/response**: with [`SendFlags::WAIT_REPLY`] the two sides
//!   cross-link their records and hold a reference on each other, so the
//!   eventual [`respond`] finds its target even if the requester moved
//!   between queues meanwhile. Both references are released exactly once:
//!   at response delivery or at purge.
//!
//! Process exit purges the wait queue; every thread blocked on the dead
//! process's behalf wakes with a failed-IPC status (`wait::purge_process`).

use bitflags::bitflags;

use crate::config::TB_MSG_BUF_SIZE;
use crate::ipc_log;
use crate::metrics::METRICS;
use crate::task::{self, ProcessRef, ProcessState, ThreadRef, ThreadState, WakeStatus};
use crate::wait::{self, WaitKind};

/// Number of parameter slots in a message
pub const MSG_PARAM_SLOTS: usize = 8;

/// Fixed message header bytes (identity + opcode + counts + params)
pub const MSG_HEADER_BYTES: usize = 8 * 3 + 4 + 4 + 8 * MSG_PARAM_SLOTS;

/// Maximum data blob length
pub const MSG_DATA_MAX: usize = TB_MSG_BUF_SIZE - MSG_HEADER_BYTES;

/// A message as it sits in a thread's send/receive buffer.
///
/// `sender_pid`/`sender_tid` are written by the kernel during delivery.
#[repr(C)]
pub struct Message {
    pub sender_pid: u64,
    pub sender_tid: u64,
    pub opcode: u64,
    pub param_count: u32,
    pub data_len: u32,
    pub params: [u64; MSG_PARAM_SLOTS],
    pub data: [u8; MSG_DATA_MAX],
}

const _: () = assert!(core::mem::size_of::<Message>() == TB_MSG_BUF_SIZE);

impl Message {
    /// Append a parameter, insertion-ordered. `false` when full.
    pub fn push_param(&mut self, value: u64) -> bool {
        let i = self.param_count as usize;
        if i >= MSG_PARAM_SLOTS {
            return false;
        }
        self.params[i] = value;
        self.param_count += 1;
        true
    }

    /// Parameter at `index`, if present
    pub fn param(&self, index: usize) -> Option<u64> {
        if index < self.param_count as usize {
            Some(self.params[index])
        } else {
            None
        }
    }

    /// Install the data blob. `false` when it does not fit.
    pub fn set_data(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > MSG_DATA_MAX {
            return false;
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.data_len = bytes.len() as u32;
        true
    }

    /// The data blob
    pub fn data(&self) -> &[u8] {
        &self.data[..(self.data_len as usize).min(MSG_DATA_MAX)]
    }
}

bitflags! {
    /// Delivery options for [`request`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SendFlags: u32 {
        /// Spawn a popup handler thread instead of matching a receiver
        const POPUP      = 1 << 0;
        /// Block until the receiver responds
        const WAIT_REPLY = 1 << 1;
    }
}

/// IPC errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Destination process does not exist or is exiting
    BadTarget,
    /// Destination has no popup handler registered
    NoHandler,
    /// The message in the send buffer is malformed
    BadMessage,
    /// The caller owes no reply
    NotWaitingReply,
    /// The peer vanished before delivery
    Failed,
    /// Creating the popup thread failed
    OutOfMemory,
}

/// How a send or receive concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcOutcome {
    /// The message changed hands; the caller keeps running
    Delivered,
    /// The caller is asleep on the IPC queue
    Blocked,
}

/// Stamp the sender identity and opcode into a thread's outgoing message,
/// and validate the user-controlled counts.
fn seal_outgoing(sender: &ThreadRef, opcode: u64) -> Result<(), IpcError> {
    let msg = sender.msg_send as *mut Message;
    unsafe {
        if (*msg).data_len as usize > MSG_DATA_MAX
            || (*msg).param_count as usize > MSG_PARAM_SLOTS
        {
            return Err(IpcError::BadMessage);
        }
        (*msg).sender_pid = sender.pid;
        (*msg).sender_tid = sender.id;
        (*msg).opcode = opcode;
    }
    Ok(())
}

/// Copy the used part of a sealed message between thread buffers
///
/// # Safety
/// Both pointers must be live, kernel-visible message buffers.
unsafe fn copy_message(src: *const u8, dst: *mut u8) {
    let used = {
        let msg = &*(src as *const Message);
        MSG_HEADER_BYTES + (msg.data_len as usize).min(MSG_DATA_MAX)
    };
    core::ptr::copy_nonoverlapping(src, dst, used);
}

/// Cross-link a requester with the thread that will answer it. Each side
/// holds a reference on the other until [`respond`] or a purge releases
/// it.
fn link_for_reply(requester: &ThreadRef, responder: &ThreadRef) {
    // Two thread locks: lowest id first
    if requester.id < responder.id {
        requester.lock().ipc_wait = Some(responder.clone());
        responder.lock().ipc_reply_to = Some(requester.clone());
    } else {
        responder.lock().ipc_reply_to = Some(requester.clone());
        requester.lock().ipc_wait = Some(responder.clone());
    }
}

/// Register the calling process's popup handler entry point
pub fn register_handler(proc: &ProcessRef, entry: usize) {
    proc.lock().popup_entry = Some(entry);
    ipc_log!("process {} registered popup handler {:#x}", proc.id, entry);
}

/// Send the message in `sender`'s send buffer to `dst_pid`.
///
/// Popup mode spawns a handler thread; serial mode matches a blocked
/// receiver or blocks the sender until one arrives. With
/// [`SendFlags::WAIT_REPLY`] the sender always ends up blocked awaiting
/// [`respond`].
pub fn request(
    sender: &ThreadRef,
    dst_pid: u64,
    opcode: u64,
    flags: SendFlags,
) -> Result<IpcOutcome, IpcError> {
    let dst = task::acquire_process(dst_pid).ok_or(IpcError::BadTarget)?;
    seal_outgoing(sender, opcode)?;

    if flags.contains(SendFlags::POPUP) {
        return popup_deliver(sender, &dst, opcode, flags);
    }

    // Serial: hand the message to the longest-waiting receiver
    loop {
        let entry = match wait::take_receiver(dst_pid) {
            Some(e) => e,
            None => break,
        };
        let receiver = match task::acquire_thread(entry.tid) {
            Some(t) => t,
            // Receiver died between queue and table; try the next one
            None => continue,
        };

        unsafe {
            copy_message(sender.msg_send, receiver.msg_recv);
        }
        if flags.contains(SendFlags::WAIT_REPLY) {
            link_for_reply(sender, &receiver);
        }
        wait::wake_thread(&receiver, WakeStatus::Ok);
        METRICS.inc_ipc_sent();

        if flags.contains(SendFlags::WAIT_REPLY) {
            wait::sleep_thread(
                sender,
                WaitKind::IpcReply {
                    partner: receiver.id,
                    partner_pid: receiver.pid,
                },
                None,
            );
            return Ok(IpcOutcome::Blocked);
        }
        return Ok(IpcOutcome::Delivered);
    }

    // No receiver: the sender sleeps on a reserved wait kind until one
    // calls `receive`
    {
        let pm = dst.lock();
        if pm.state != ProcessState::Normal {
            return Err(IpcError::BadTarget);
        }
    }
    wait::sleep_thread(
        sender,
        WaitKind::IpcSend {
            dst: dst_pid,
            wants_reply: flags.contains(SendFlags::WAIT_REPLY),
        },
        None,
    );
    Ok(IpcOutcome::Blocked)
}

/// Popup delivery: one fresh handler thread per message
fn popup_deliver(
    sender: &ThreadRef,
    dst: &ProcessRef,
    opcode: u64,
    flags: SendFlags,
) -> Result<IpcOutcome, IpcError> {
    let handler_tid = {
        let mut pm = dst.lock();
        if pm.state != ProcessState::Normal {
            return Err(IpcError::BadTarget);
        }
        let entry = pm.popup_entry.ok_or(IpcError::NoHandler)?;
        task::create_thread(dst, &mut pm, entry, opcode as usize, dst.kind.is_user())
            .map_err(|_| IpcError::OutOfMemory)?
    };

    let handler = task::acquire_thread(handler_tid).ok_or(IpcError::Failed)?;
    unsafe {
        copy_message(sender.msg_send, handler.msg_recv);
    }
    if flags.contains(SendFlags::WAIT_REPLY) {
        link_for_reply(sender, &handler);
    }
    task::start_thread(handler_tid).map_err(|_| IpcError::Failed)?;
    METRICS.inc_ipc_sent();

    ipc_log!(
        "popup {} → process {} (thread {})",
        opcode,
        dst.id,
        handler_tid
    );

    if flags.contains(SendFlags::WAIT_REPLY) {
        wait::sleep_thread(
            sender,
            WaitKind::IpcReply {
                partner: handler_tid,
                partner_pid: dst.id,
            },
            None,
        );
        return Ok(IpcOutcome::Blocked);
    }
    Ok(IpcOutcome::Delivered)
}

/// Receive the next message addressed to the calling thread's process.
///
/// A pending sender is consumed immediately; its message lands in the
/// receive buffer before this returns `Delivered`. Otherwise the caller
/// blocks until [`request`] matches it.
pub fn receive(receiver: &ThreadRef) -> Result<IpcOutcome, IpcError> {
    loop {
        let entry = match wait::take_sender(receiver.pid) {
            Some(e) => e,
            None => break,
        };
        let sender = match task::acquire_thread(entry.tid) {
            Some(t) => t,
            None => continue,
        };

        unsafe {
            copy_message(sender.msg_send, receiver.msg_recv);
        }
        METRICS.inc_ipc_received();

        match entry.kind {
            WaitKind::IpcSend {
                wants_reply: true, ..
            } => {
                // The sender stays asleep, now waiting for our reply
                link_for_reply(&sender, receiver);
                wait::resleep_as(
                    entry,
                    WaitKind::IpcReply {
                        partner: receiver.id,
                        partner_pid: receiver.pid,
                    },
                );
            }
            _ => {
                wait::wake_thread(&sender, WakeStatus::Ok);
            }
        }
        return Ok(IpcOutcome::Delivered);
    }

    wait::sleep_thread(receiver, WaitKind::IpcReceive { pid: receiver.pid }, None);
    Ok(IpcOutcome::Blocked)
}

/// Deliver the message in `responder`'s send buffer to the requester it
/// owes a reply, waking it. Releases both cross-references exactly once.
pub fn respond(responder: &ThreadRef) -> Result<(), IpcError> {
    let partner = responder
        .lock()
        .ipc_reply_to
        .take()
        .ok_or(IpcError::NotWaitingReply)?;

    seal_outgoing(responder, {
        // Echo the opcode the responder put in its send buffer
        unsafe { (*(responder.msg_send as *const Message)).opcode }
    })?;

    // The requester may have been purged or exited while we worked; its
    // buffers are only writable while it still sleeps for us
    let deliverable = {
        let tm = partner.lock();
        tm.state == ThreadState::Wait
    };
    if !deliverable {
        let _ = partner.lock().ipc_wait.take();
        return Err(IpcError::Failed);
    }

    unsafe {
        copy_message(responder.msg_send, partner.msg_recv);
    }
    METRICS.inc_ipc_received();

    // Drop the requester's back-reference to us, then wake it
    let back = partner.lock().ipc_wait.take();
    drop(back);
    wait::wake_tid(partner.id, WakeStatus::Ok);

    ipc_log!("reply delivered to thread {}", partner.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::acquire_thread;
    use crate::testutil::{self, set_cpu, spawn_test_thread};

    fn outgoing(t: &ThreadRef) -> &'static mut Message {
        unsafe { &mut *(t.msg_send as *mut Message) }
    }

    fn incoming(t: &ThreadRef) -> &'static Message {
        unsafe { &*(t.msg_recv as *const Message) }
    }

    fn reset_msg(m: &mut Message) {
        m.param_count = 0;
        m.data_len = 0;
    }

    #[test]
    fn serial_delivery_to_waiting_receiver() {
        testutil::boot();
        set_cpu(0);

        let server = testutil::test_process("ipc-server");
        let client = testutil::test_process("ipc-client");
        let rx = spawn_test_thread(&server);
        let tx = spawn_test_thread(&client);

        assert_eq!(receive(&rx), Ok(IpcOutcome::Blocked));

        let m = outgoing(&tx);
        reset_msg(m);
        m.push_param(11);
        m.push_param(22);
        m.set_data(b"hello");

        assert_eq!(
            request(&tx, server.id, 7, SendFlags::empty()),
            Ok(IpcOutcome::Delivered)
        );

        // Receiver woke with the message, identity stamped by the kernel
        assert_eq!(rx.lock().state, ThreadState::Normal);
        let got = incoming(&rx);
        assert_eq!(got.opcode, 7);
        assert_eq!(got.sender_pid, client.id);
        assert_eq!(got.sender_tid, tx.id);
        assert_eq!(got.param(0), Some(11));
        assert_eq!(got.param(1), Some(22));
        assert_eq!(got.param(2), None);
        assert_eq!(got.data(), b"hello");

        for t in [rx, tx] {
            testutil::retire_test_thread(t);
        }
    }

    #[test]
    fn sender_blocks_until_receiver_arrives() {
        testutil::boot();
        set_cpu(0);

        let server = testutil::test_process("ipc-late");
        let client = testutil::test_process("ipc-early");
        let tx = spawn_test_thread(&client);
        let rx = spawn_test_thread(&server);

        reset_msg(outgoing(&tx));
        outgoing(&tx).set_data(b"queued");
        assert_eq!(
            request(&tx, server.id, 1, SendFlags::empty()),
            Ok(IpcOutcome::Blocked)
        );
        assert_eq!(tx.lock().state, ThreadState::Wait);

        // The late receiver picks the queued sender up synchronously
        assert_eq!(receive(&rx), Ok(IpcOutcome::Delivered));
        assert_eq!(incoming(&rx).data(), b"queued");
        assert_eq!(tx.lock().state, ThreadState::Normal);

        for t in [rx, tx] {
            testutil::retire_test_thread(t);
        }
    }

    #[test]
    fn request_response_pairing() {
        testutil::boot();
        set_cpu(0);

        let server = testutil::test_process("ipc-rr-srv");
        let client = testutil::test_process("ipc-rr-cli");
        let rx = spawn_test_thread(&server);
        let tx = spawn_test_thread(&client);

        assert_eq!(receive(&rx), Ok(IpcOutcome::Blocked));

        reset_msg(outgoing(&tx));
        outgoing(&tx).push_param(99);
        assert_eq!(
            request(&tx, server.id, 5, SendFlags::WAIT_REPLY),
            Ok(IpcOutcome::Blocked)
        );

        // Both sides are cross-linked while the request is outstanding
        assert!(tx.lock().ipc_wait.is_some());
        assert!(rx.lock().ipc_reply_to.is_some());
        assert_eq!(tx.lock().state, ThreadState::Wait);

        let m = outgoing(&rx);
        reset_msg(m);
        m.opcode = 5;
        m.set_data(b"the answer");
        assert_eq!(respond(&rx), Ok(()));

        // Exactly one respond completes the pair and releases both links
        assert_eq!(tx.lock().state, ThreadState::Normal);
        assert_eq!(tx.lock().wake_status, WakeStatus::Ok);
        assert_eq!(incoming(&tx).data(), b"the answer");
        assert!(tx.lock().ipc_wait.is_none());
        assert!(rx.lock().ipc_reply_to.is_none());
        assert_eq!(respond(&rx), Err(IpcError::NotWaitingReply));

        for t in [rx, tx] {
            testutil::retire_test_thread(t);
        }
    }

    #[test]
    fn popup_spawns_handler_with_message() {
        testutil::boot();
        set_cpu(0);

        let server = testutil::test_process("ipc-popup");
        let client = testutil::test_process("ipc-popper");
        let tx = spawn_test_thread(&client);

        register_handler(&server, 0x5000);

        reset_msg(outgoing(&tx));
        outgoing(&tx).set_data(b"popup payload");
        let before = {
            let pm = server.lock();
            pm.threads.len()
        };
        assert_eq!(
            request(&tx, server.id, 42, SendFlags::POPUP),
            Ok(IpcOutcome::Delivered)
        );

        // A fresh handler thread exists, queued, carrying the message
        let handler_tid = {
            let pm = server.lock();
            assert_eq!(pm.threads.len(), before + 1);
            *pm.threads.iter().last().unwrap()
        };
        let handler = acquire_thread(handler_tid).unwrap();
        assert_eq!(handler.lock().state, ThreadState::Sched);
        assert_eq!(incoming(&handler).opcode, 42);
        assert_eq!(incoming(&handler).data(), b"popup payload");

        task::exit_thread(&handler);
        task::reap();
        testutil::retire_test_thread(tx);
    }

    #[test]
    fn popup_without_handler_fails() {
        testutil::boot();
        set_cpu(0);

        let server = testutil::test_process("ipc-nohandler");
        let client = testutil::test_process("ipc-sad");
        let tx = spawn_test_thread(&client);

        assert_eq!(
            request(&tx, server.id, 1, SendFlags::POPUP),
            Err(IpcError::NoHandler)
        );
        assert_eq!(
            request(&tx, 0xDEAD_BEEF, 1, SendFlags::empty()),
            Err(IpcError::BadTarget)
        );
        testutil::retire_test_thread(tx);
    }

    #[test]
    fn purge_fails_outstanding_requests() {
        testutil::boot();
        set_cpu(0);

        let dying = testutil::test_process("ipc-dying");
        let client = testutil::test_process("ipc-victims");

        // N requesters blocked toward the dying process
        let n = 3;
        let mut txs = std::vec::Vec::new();
        for _ in 0..n {
            let tx = spawn_test_thread(&client);
            reset_msg(outgoing(&tx));
            assert_eq!(
                request(&tx, dying.id, 1, SendFlags::WAIT_REPLY),
                Ok(IpcOutcome::Blocked)
            );
            txs.push(tx);
        }

        // Exactly N waiters wake, all with a failure indication
        let woken = crate::wait::purge_process(dying.id);
        assert_eq!(woken, n);
        for tx in &txs {
            assert_eq!(tx.lock().state, ThreadState::Normal);
            assert_eq!(tx.lock().wake_status, WakeStatus::Failed);
            assert!(tx.lock().ipc_wait.is_none());
        }

        for t in txs {
            testutil::retire_test_thread(t);
        }
    }
}
