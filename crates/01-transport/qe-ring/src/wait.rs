//! Wait-for-write notification for consumer queues.
//!
//! Hardware with a monitor/wait primitive lets a dequeuing thread sleep until
//! the device writes the next CQ line. The [`Doorbell`] models that primitive:
//! the producer side bumps a sequence after each published entry, and a waiter
//! parks until the sequence moves past the value it observed or its deadline
//! passes. Loom builds never park, mirroring the stubbed wait shims of the ring
//! tests.

use parking_lot::{Condvar, Mutex};
use std::time::Instant;

/// Result of attempting to wait on the doorbell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// The caller was woken by a ring after parking.
    Ok,
    /// The sequence had already moved when the wait was attempted.
    NotEqual,
    /// The deadline passed before a ring was observed.
    TimedOut,
}

/// Sequence counter with blocking waits, rung once per device write.
#[derive(Debug, Default)]
pub struct Doorbell {
    seq: Mutex<u64>,
    cond: Condvar,
}

impl Doorbell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current ring count; pass it to [`Doorbell::wait`] before re-checking the queue.
    pub fn sequence(&self) -> u64 {
        *self.seq.lock()
    }

    /// Signals that a new entry is visible and wakes every waiter.
    pub fn ring(&self) {
        let mut seq = self.seq.lock();
        *seq = seq.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Parks until the sequence differs from `seen` or `deadline` passes.
    #[cfg(not(feature = "loom"))]
    pub fn wait(&self, seen: u64, deadline: Instant) -> WaitResult {
        let mut seq = self.seq.lock();
        if *seq != seen {
            return WaitResult::NotEqual;
        }
        while *seq == seen {
            if self.cond.wait_until(&mut seq, deadline).timed_out() {
                return if *seq == seen {
                    WaitResult::TimedOut
                } else {
                    WaitResult::Ok
                };
            }
        }
        WaitResult::Ok
    }

    #[cfg(feature = "loom")]
    pub fn wait(&self, seen: u64, deadline: Instant) -> WaitResult {
        let _ = deadline;
        if self.sequence() != seen {
            WaitResult::NotEqual
        } else {
            WaitResult::TimedOut
        }
    }
}
