//! Event scheduling core for a hardware scheduling accelerator.
//!
//! The crate sits between applications and a device implementing
//! [`hw_iface::HwDevice`]:
//! * [`EventDev`] – probe, configure, start, stop and close one device's
//!   scheduling domain, plus queue/port setup and the link manager.
//! * [`EventPort`] – the lock-free data path of one port: enqueue bursts of
//!   [`Event`]s and dequeue them from the port's generation-bit CQ.
//! * [`credit`] – software and hardware credit accounting that bounds work in flight.
//! * [`EvError`] – control-path error surface; data-path shortfalls are
//!   reported as a short [`Burst`].

pub mod config;
pub mod consts;
mod cos;
pub mod credit;
mod dequeue;
mod domain;
mod enqueue;
mod error;
mod event;
mod link;
pub mod pause;
mod port;
mod queue;
mod reorder;
mod sn;

pub use config::{
    Cos, DevArgs, DomainConfig, PortConfig, PortHint, QueueConfig, QueueSched, TokenPopMode,
};
pub use credit::{CreditKind, FlushedCredits, PoolLevel};
pub use domain::{ConfigState, CreditSnapshot, DevInfo, DevState, EventDev};
pub use enqueue::{Burst, StopReason};
pub use error::{EvError, EvResult, Resource};
pub use event::{Event, EventOp, SchedType};
pub use pause::{NoPause, PausePolicy, SpinPause, YieldPause};
pub use port::{EventPort, WaitStrategy};

pub use hw_iface;
pub use qe_ring;
