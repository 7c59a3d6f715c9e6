//! Hardware boundary of the event scheduler.
//!
//! The scheduling core never touches registers. Everything it needs from the
//! accelerator goes through [`HwDevice`]: resource queries, domain and
//! queue/port creation, queue-to-port mapping, sequence-number groups and the
//! bulk write of command words. Each call reports a vendor [`HwStatus`] on
//! failure; the core logs the status string verbatim and otherwise treats it
//! as opaque.
//!
//! [`SimDevice`] implements the boundary in memory. It schedules events the
//! way the accelerator does (atomic flow pinning, priority round robin,
//! directed delivery, CQ token and history-list limits) and writes entries
//! into each port's [`qe_ring::CqRing`] with generation bits, so the full data
//! path can run on hosts without the device.

#![allow(missing_docs)]

mod device;
mod sim;
mod status;
mod types;

pub use device::HwDevice;
pub use sim::{SimConfig, SimDevice};
pub use status::{HwError, HwOp, HwResult, HwStatus};
pub use types::{
    DeviceVersion, DirPortArgs, DirQueueArgs, DomainArgs, DomainId, HwPort, HwQueue, LdbPortArgs,
    LdbQueueArgs, ResourceCounts, NUM_COS, NUM_SN_GROUPS, SN_GROUP_CAPACITY,
};
