//! Error handling helpers for the ring crate.
//!
//! The ring layer keeps its error surface small: depth validation and
//! allocation failures. Everything above it (credits, links, hardware status)
//! is reported by the crates that own those concerns.

use std::fmt;

/// Convenience result alias for fallible ring operations.
pub type RingResult<T, E = RingError> = Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Errors surfaced by low-level ring helpers.
pub enum RingError {
    /// Requested ring depth is outside the supported range or not a power of two.
    InvalidDepth {
        requested: u32,
        minimum: u32,
        maximum: u32,
    },
    /// Allocation of a shared region failed for the given size/alignment pair.
    AllocationFailed { size: usize, alignment: usize },
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingError::InvalidDepth {
                requested,
                minimum,
                maximum,
            } => {
                write!(
                    f,
                    "ring depth {requested} must be a power of two between {minimum} and {maximum}"
                )
            }
            RingError::AllocationFailed { size, alignment } => {
                write!(
                    f,
                    "failed to allocate shared region of {size} bytes aligned to {alignment}"
                )
            }
        }
    }
}

impl std::error::Error for RingError {}
