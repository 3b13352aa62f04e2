//! Combining synchronization.
//!
//! Contenders enqueue operation words into a shared MPMC ring, then one of
//! them wins the combiner lock and executes queued operations on behalf of
//! everybody, up to a handoff bound per acquisition. Each contender spins on
//! its own completion predicate with exponential backoff, retrying for the
//! lock while its operation is still outstanding.

use std::sync::atomic::{fence, Ordering};

use crate::ring::MpmcRing;
use crate::spin::{Backoff, SpinLock};

pub struct Combiner {
    ring: MpmcRing,
    lock: SpinLock,
    handoff: usize,
    routine: fn(usize),
}

impl Combiner {
    /// `size` is the ring capacity (power of two); `handoff` bounds how many
    /// operations one winner performs before releasing the lock.
    pub fn new(routine: fn(usize), size: usize, handoff: usize) -> Combiner {
        assert!(handoff > 0);
        Combiner {
            ring: MpmcRing::new(size),
            lock: SpinLock::new(),
            handoff,
            routine,
        }
    }

    /// Execute `data` under the combiner. Returns once `is_done` reports the
    /// operation finished — executed by this caller or by another winner.
    pub fn execute(&self, data: usize, is_done: impl Fn() -> bool) {
        self.ring.enqueue(data);

        let mut backoff = Backoff::new();
        while !is_done() {
            if self.lock.try_lock() {
                let mut performed = 0;
                while performed < self.handoff {
                    match self.ring.get() {
                        Some(word) => {
                            (self.routine)(word);
                            performed += 1;
                        }
                        None => break,
                    }
                }
                self.lock.unlock();
                if is_done() {
                    break;
                }
            }
            backoff.spin();
        }
        // Pair with the performer's releases before the caller reads the
        // operation's outputs.
        fence(Ordering::Acquire);
    }
}
