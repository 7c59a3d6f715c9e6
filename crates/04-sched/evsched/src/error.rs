use hw_iface::HwError;
use qe_ring::RingError;
use std::fmt;
use thiserror::Error;

use crate::credit::CreditKind;
use crate::domain::DevState;

pub type EvResult<T> = Result<T, EvError>;

/// A recoverable shortage; the caller may retry once work is released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    SoftwareCredits,
    HardwareCredits(CreditKind),
    LinkSlots,
    SequenceNumbers,
    DirectedQueueSlots,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::SoftwareCredits => f.write_str("software credits"),
            Resource::HardwareCredits(kind) => write!(f, "{kind} hardware credits"),
            Resource::LinkSlots => f.write_str("port link slots"),
            Resource::SequenceNumbers => f.write_str("sequence-number groups"),
            Resource::DirectedQueueSlots => f.write_str("directed queue slots"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EvError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(Resource),

    #[error("hardware boundary rejected request: {0}")]
    Hardware(#[from] HwError),

    #[error("ring setup failed: {0}")]
    Ring(#[from] RingError),

    #[error("caller misuse: {0}")]
    CallerMisuse(&'static str),

    #[error("{op} not allowed while device is {state}")]
    InvalidState { op: &'static str, state: DevState },

    #[error("link entry {index} failed after {linked} succeeded: {source}")]
    LinkFailed {
        index: usize,
        linked: usize,
        source: Box<EvError>,
    },
}

impl EvError {
    pub fn config(msg: impl Into<String>) -> Self {
        EvError::Config(msg.into())
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, EvError::ResourceExhausted(_))
    }
}

/// Logs a boundary rejection with its vendor status string and lifts it into [`EvError`].
pub(crate) fn hw_err(err: HwError) -> EvError {
    EvError::Hardware(err.logged())
}
