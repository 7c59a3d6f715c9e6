//! Ring primitives shared by the scheduling core and the device boundary.
//!
//! This crate exposes the memory-level pieces of a port's consumer path:
//! * [`SharedRegion`] – contiguous, aligned, zeroed memory backing each consumer queue.
//! * [`Qe`] – the 16-byte queue entry used both for command words and consumer entries.
//! * [`CqRing`] / [`CqCursor`] – the generation-bit consumer queue and its read cursor.
//! * [`classify_slots`] – the pure validity check at the heart of ring consumption.
//! * [`Doorbell`] – wait-for-write notification bounded by a deadline.
//! * [`RingError`] – lightweight error surface for allocation/config failures.

mod barrier;
mod cq_ring;
mod error;
mod qe;
mod region;
pub mod wait;

pub use barrier::device_write_fence;
pub use cq_ring::{
    classify_packed, classify_slots, CqCursor, CqPollMode, CqRing, MAX_CQ_DEPTH, MIN_CQ_DEPTH,
};
pub use error::{RingError, RingResult};
pub use qe::{cmd, HwSchedType, Qe, QE_BATCH, QE_SIZE};
pub use region::SharedRegion;
pub use wait::{Doorbell, WaitResult};
