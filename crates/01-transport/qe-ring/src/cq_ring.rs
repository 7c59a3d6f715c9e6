//! Generation-bit consumer queue (CQ).
//!
//! The device writes one [`Qe`] per slot and never clears a slot once the
//! consumer has read it. Instead, every entry carries a generation bit in its
//! status byte: on the first pass over the ring the device writes `1`, on the
//! second pass `0`, and so on. Zeroed memory therefore reads as "not yet
//! produced" for the first pass. The consumer keeps an unmasked read index and
//! the bit it expects at that index, flipping the expectation each time the
//! index wraps. A slot is valid exactly when its observed bit equals the
//! expected bit.
//!
//! Reads are done in windows of up to [`QE_BATCH`] slots that never straddle
//! the wrap point, so one expected bit covers the whole window. Publication is
//! two stores: word 0 (payload) relaxed, then word 1 (with the generation bit)
//! release; the consumer acquires word 1 before touching word 0.
//!
//! In sparse poll mode the device places each entry on its own 64-byte line,
//! so logical slot `i` lives at physical slot `i * 4`.

use crate::qe::{Qe, QE_BATCH};
use crate::region::SharedRegion;
use crate::wait::Doorbell;
use crate::{RingError, RingResult};
use core::mem;
#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU64, Ordering};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU64, Ordering};

/// Smallest consumer queue the device accepts.
pub const MIN_CQ_DEPTH: u32 = 8;
/// Largest consumer queue the device accepts.
pub const MAX_CQ_DEPTH: u32 = 1024;

const CQ_ALIGNMENT: usize = 64;
const SPARSE_STRIDE: usize = 4;

/// Layout of entries inside the CQ memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CqPollMode {
    /// Entries are packed back to back, four per cache line.
    #[default]
    Standard,
    /// One entry per cache line.
    Sparse,
}

impl CqPollMode {
    pub const fn stride(self) -> usize {
        match self {
            CqPollMode::Standard => 1,
            CqPollMode::Sparse => SPARSE_STRIDE,
        }
    }
}

#[repr(C, align(16))]
struct CqSlot {
    words: [AtomicU64; 2],
}

impl CqSlot {
    fn new() -> Self {
        Self {
            words: [AtomicU64::new(0), AtomicU64::new(0)],
        }
    }
}

/// Counts the valid slots at the front of a read window.
///
/// `window` holds the observed generation bit of each consecutive slot (only
/// bit 0 is inspected) and `expected_bit` is the bit the consumer expects at
/// the first slot. Because a window never crosses the wrap point, every slot
/// in it shares the same expectation. Consumption is strictly in order, so
/// counting stops at the first mismatch even if later slots happen to match.
pub fn classify_slots(window: &[u8], expected_bit: u8) -> usize {
    let expected = expected_bit & 1;
    window
        .iter()
        .take_while(|bit| (**bit & 1) == expected)
        .count()
}

/// Packed form of [`classify_slots`] for windows of at most eight slots.
///
/// Bit `i` of `bits` is the generation bit of slot `i`. The observed bits are
/// xored with the expectation replicated across the byte; valid slots become
/// zero, and the answer is the run of trailing zeros, capped at `len` by a
/// sentinel bit.
pub fn classify_packed(bits: u8, len: usize, expected_bit: u8) -> usize {
    debug_assert!(len <= 8);
    let fill = if expected_bit & 1 == 1 { 0xFF } else { 0x00 };
    let mismatch = u32::from(bits ^ fill) | (1u32 << len);
    mismatch.trailing_zeros() as usize
}

/// Consumer read position within a [`CqRing`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CqCursor {
    idx: u32,
    mask: u32,
    gen_bit: u8,
}

impl CqCursor {
    pub fn new(depth: u32) -> Self {
        debug_assert!(depth.is_power_of_two());
        Self {
            idx: 0,
            mask: depth - 1,
            gen_bit: 1,
        }
    }

    /// Unmasked number of entries consumed so far.
    pub fn index(&self) -> u32 {
        self.idx
    }

    pub fn gen_bit(&self) -> u8 {
        self.gen_bit
    }

    /// Size of the next read window, bounded by `max`, the batch size and the wrap point.
    pub fn window(&self, max: usize) -> usize {
        let to_wrap = (self.mask + 1 - (self.idx & self.mask)) as usize;
        max.min(QE_BATCH).min(to_wrap)
    }

    /// Moves past `n` consumed slots, flipping the expected bit on wrap.
    pub fn advance(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.idx = self.idx.wrapping_add(n as u32);
        if self.idx & self.mask == 0 {
            self.gen_bit ^= 1;
        }
    }
}

/// Device-written ring of queue entries owned by one port.
pub struct CqRing {
    region: SharedRegion,
    depth: u32,
    mode: CqPollMode,
    doorbell: Doorbell,
}

impl core::fmt::Debug for CqRing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CqRing")
            .field("depth", &self.depth)
            .field("mode", &self.mode)
            .finish()
    }
}

impl CqRing {
    /// Allocates a zeroed ring of `depth` entries.
    pub fn new(depth: u32, mode: CqPollMode) -> RingResult<Self> {
        if !depth.is_power_of_two() || !(MIN_CQ_DEPTH..=MAX_CQ_DEPTH).contains(&depth) {
            return Err(RingError::InvalidDepth {
                requested: depth,
                minimum: MIN_CQ_DEPTH,
                maximum: MAX_CQ_DEPTH,
            });
        }
        let slots = depth as usize * mode.stride();
        let bytes = slots * mem::size_of::<CqSlot>();
        let region = SharedRegion::zeroed(bytes, CQ_ALIGNMENT.max(mem::align_of::<CqSlot>()))?;
        let base = region.as_ptr() as *mut CqSlot;
        for i in 0..slots {
            // SAFETY: the region was just allocated for `slots` aligned slots and
            // is not yet shared.
            unsafe { base.add(i).write(CqSlot::new()) };
        }
        Ok(Self {
            region,
            depth,
            mode,
            doorbell: Doorbell::new(),
        })
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn poll_mode(&self) -> CqPollMode {
        self.mode
    }

    pub fn doorbell(&self) -> &Doorbell {
        &self.doorbell
    }

    fn slots(&self) -> &[CqSlot] {
        let count = self.depth as usize * self.mode.stride();
        // SAFETY: every slot was initialised in `new` and the region is sized for `count`.
        unsafe { self.region.view::<CqSlot>(count) }
    }

    fn slot(&self, logical: u32) -> &CqSlot {
        let physical = (logical & (self.depth - 1)) as usize * self.mode.stride();
        &self.slots()[physical]
    }

    /// Device side: writes the `seq`-th entry ever produced into this ring.
    ///
    /// The caller guarantees the consumer has returned the token for the entry
    /// previously occupying the slot.
    pub fn publish(&self, seq: u64, qe: &Qe) {
        let pass = (seq / u64::from(self.depth)) & 1;
        let gen = 1 ^ pass as u8;
        let mut entry = *qe;
        entry.status = (entry.status & !1) | gen;
        let words = entry.encode();
        let slot = self.slot(seq as u32);
        slot.words[0].store(words[0], Ordering::Relaxed);
        slot.words[1].store(words[1], Ordering::Release);
        self.doorbell.ring();
    }

    fn load_window(&self, cursor: &CqCursor, max: usize) -> ([u64; QE_BATCH], usize) {
        let len = cursor.window(max);
        let mut word1 = [0u64; QE_BATCH];
        for (i, w) in word1.iter_mut().enumerate().take(len) {
            *w = self.slot(cursor.index().wrapping_add(i as u32)).words[1].load(Ordering::Acquire);
        }
        (word1, len)
    }

    fn decode_at(&self, cursor: &CqCursor, i: usize, word1: u64) -> Qe {
        let slot = self.slot(cursor.index().wrapping_add(i as u32));
        Qe::decode([slot.words[0].load(Ordering::Relaxed), word1])
    }

    /// Reads one window of valid entries into `out`, scalar variant.
    pub fn poll(&self, cursor: &mut CqCursor, out: &mut [Qe]) -> usize {
        let (word1, len) = self.load_window(cursor, out.len());
        let mut bits = [0u8; QE_BATCH];
        for (bit, w) in bits.iter_mut().zip(word1.iter()).take(len) {
            *bit = (u64::from_le(*w) >> 48) as u8 & 1;
        }
        let valid = classify_slots(&bits[..len], cursor.gen_bit());
        for (i, qe) in out.iter_mut().enumerate().take(valid) {
            *qe = self.decode_at(cursor, i, word1[i]);
        }
        cursor.advance(valid);
        valid
    }

    /// Same contract as [`CqRing::poll`], classifying the window as one packed mask.
    pub fn poll_packed(&self, cursor: &mut CqCursor, out: &mut [Qe]) -> usize {
        let (word1, len) = self.load_window(cursor, out.len());
        let packed = word1
            .iter()
            .take(len)
            .enumerate()
            .fold(0u8, |acc, (i, w)| acc | ((((u64::from_le(*w) >> 48) & 1) as u8) << i));
        let valid = classify_packed(packed, len, cursor.gen_bit());
        for (i, qe) in out.iter_mut().enumerate().take(valid) {
            *qe = self.decode_at(cursor, i, word1[i]);
        }
        cursor.advance(valid);
        valid
    }

    /// Returns true when the entry at the cursor has been produced.
    pub fn has_entry(&self, cursor: &CqCursor) -> bool {
        let word1 = u64::from_le(self.slot(cursor.index()).words[1].load(Ordering::Acquire));
        ((word1 >> 48) as u8 & 1) == cursor.gen_bit()
    }
}

impl Drop for CqRing {
    fn drop(&mut self) {
        let count = self.depth as usize * self.mode.stride();
        let base = self.region.as_ptr() as *mut CqSlot;
        for i in 0..count {
            // SAFETY: each slot was written in `new` and is dropped exactly once here.
            unsafe { core::ptr::drop_in_place(base.add(i)) };
        }
    }
}
