/// Rendezvous barrier with the local-copy trick
///
/// The barrier itself holds only one word: a pointer slot. The first thread
/// to arrive installs a record living on its own stack into the slot via
/// CAS; latecomers find the installed record and count themselves in. The
/// winner retires the slot before releasing anyone, so a thread re-entering
/// for the next round never touches the previous round's state: the
/// rendezvous state is born and dies with one round.
///
/// No participant returns until all `total` have arrived, and the winner
/// (whose stack owns the round record) leaves last, after every follower
/// has observed the release.
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::hal;

/// Per-round rendezvous state, stack-local to the winning thread
struct Round {
    arrived: AtomicUsize,
    released: AtomicBool,
    departed: AtomicUsize,
}

/// A reusable symmetric rendezvous barrier
pub struct Barrier {
    slot: AtomicPtr<Round>,
}

impl Barrier {
    /// Creates a new barrier with no round in progress
    pub const fn new() -> Self {
        Barrier {
            slot: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Blocks until `total` threads (including this one) have called
    /// `wait` with the same `total`.
    ///
    /// Every round must be entered by exactly `total` participants; the
    /// winner's stack owns the round state, so an excess caller would
    /// count into a round it does not belong to.
    pub fn wait(&self, total: usize) {
        if total <= 1 {
            return;
        }

        let local = Round {
            arrived: AtomicUsize::new(1),
            released: AtomicBool::new(false),
            departed: AtomicUsize::new(0),
        };

        loop {
            let installed = self.slot.load(Ordering::Acquire);

            if installed.is_null() {
                // Try to open the round with our own stack record
                if self
                    .slot
                    .compare_exchange(
                        ptr::null_mut(),
                        &local as *const Round as *mut Round,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.finish_as_winner(&local, total);
                    return;
                }
                // Lost the install race; retry against the winner's record
                continue;
            }

            // A round is open. Count ourselves in unless it is already
            // full, which means the winner is about to retire it; spin
            // until the slot changes.
            let round = unsafe { &*installed };
            let arrived = round.arrived.load(Ordering::Relaxed);
            if arrived >= total {
                hal::relax();
                continue;
            }
            if round
                .arrived
                .compare_exchange(arrived, arrived + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            self.finish_as_follower(round);
            return;
        }
    }

    /// Winner path: wait for the field, retire the slot, release everyone,
    /// then wait until all followers have left the round state.
    fn finish_as_winner(&self, round: &Round, total: usize) {
        while round.arrived.load(Ordering::Acquire) < total {
            hal::relax();
        }

        // Retire the slot first: a thread entering the next round installs
        // fresh state instead of finding this one.
        self.slot.store(ptr::null_mut(), Ordering::Release);

        round.released.store(true, Ordering::Release);
        hal::notify();

        // The round record lives on our stack; leave only after the last
        // follower is done reading it.
        while round.departed.load(Ordering::Acquire) < total - 1 {
            hal::relax();
        }
    }

    /// Follower path: spin for the release, then check out.
    fn finish_as_follower(&self, round: &Round) {
        while !round.released.load(Ordering::Acquire) {
            hal::relax();
        }
        round.departed.fetch_add(1, Ordering::AcqRel);
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    fn rendezvous(n: usize, rounds: usize) {
        let barrier = Arc::new(Barrier::new());
        let before = Arc::new(StdAtomicUsize::new(0));
        let after = Arc::new(StdAtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..n {
            let barrier = Arc::clone(&barrier);
            let before = Arc::clone(&before);
            let after = Arc::clone(&after);
            handles.push(thread::spawn(move || {
                for round in 0..rounds {
                    before.fetch_add(1, Ordering::SeqCst);
                    barrier.wait(n);
                    // Every participant of this round has arrived by now
                    assert!(before.load(Ordering::SeqCst) >= (round + 1) * n);
                    after.fetch_add(1, Ordering::SeqCst);
                    barrier.wait(n);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(before.load(Ordering::SeqCst), n * rounds);
        assert_eq!(after.load(Ordering::SeqCst), n * rounds);
    }

    #[test]
    fn pairs_meet() {
        rendezvous(2, 50);
    }

    #[test]
    fn four_way_reusable() {
        rendezvous(4, 25);
    }

    #[test]
    fn eight_way() {
        rendezvous(8, 10);
    }

    #[test]
    fn single_participant_is_noop() {
        let barrier = Barrier::new();
        barrier.wait(1);
        barrier.wait(1);
    }
}
