//! Argument and result types exchanged across the hardware boundary.

use qe_ring::CqRing;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Number of class-of-service bandwidth classes for load-balanced ports.
pub const NUM_COS: usize = 4;
/// Number of sequence-number groups shared by ordered queues.
pub const NUM_SN_GROUPS: usize = 2;
/// Sequence numbers held by one group, split evenly among its queues.
pub const SN_GROUP_CAPACITY: u32 = 1024;

pub type DomainId = u32;

/// Device generation. V2 keeps separate load-balanced and directed credit
/// pools; V2.5 has a single combined pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceVersion {
    V2,
    V2_5,
}

impl DeviceVersion {
    pub const fn combined_credits(self) -> bool {
        matches!(self, DeviceVersion::V2_5)
    }
}

/// Resources currently free on the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCounts {
    pub num_sched_domains: u32,
    pub num_ldb_queues: u32,
    pub num_ldb_ports: u32,
    pub num_cos_ldb_ports: [u32; NUM_COS],
    pub num_dir_ports: u32,
    pub num_atomic_inflights: u32,
    pub num_hist_list_entries: u32,
    pub max_contiguous_hist_list_entries: u32,
    /// Load-balanced credits (V2 only).
    pub num_ldb_credits: u32,
    /// Directed credits (V2 only).
    pub num_dir_credits: u32,
    /// Combined credits (V2.5 only).
    pub num_credits: u32,
}

impl ResourceCounts {
    /// Credits usable for load-balanced traffic, whichever pool layout applies.
    pub fn event_credits(&self, version: DeviceVersion) -> u32 {
        if version.combined_credits() {
            self.num_credits
        } else {
            self.num_ldb_credits
        }
    }
}

/// Capacity requested for a new scheduling domain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DomainArgs {
    pub num_ldb_queues: u32,
    /// Load-balanced ports with no class-of-service preference.
    pub num_ldb_ports: u32,
    /// Load-balanced ports pinned to each class.
    pub num_cos_ldb_ports: [u32; NUM_COS],
    pub cos_strict: bool,
    pub num_dir_ports: u32,
    pub num_atomic_inflights: u32,
    pub num_hist_list_entries: u32,
    pub num_ldb_credits: u32,
    pub num_dir_credits: u32,
    pub num_credits: u32,
}

impl DomainArgs {
    pub fn total_ldb_ports(&self) -> u32 {
        self.num_ldb_ports + self.num_cos_ldb_ports.iter().sum::<u32>()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LdbQueueArgs {
    /// Zero for atomic/unordered-only queues.
    pub num_sequence_numbers: u32,
    pub num_qid_inflights: u32,
    pub num_atomic_inflights: u32,
    pub lock_id_comp_level: u32,
    pub depth_threshold: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirQueueArgs {
    /// Port the queue is paired with; a directed queue shares its port's id.
    pub port_id: Option<u32>,
    pub depth_threshold: u32,
}

/// Load-balanced port creation. The device writes into `cq` and never frees it.
#[derive(Clone, Debug)]
pub struct LdbPortArgs {
    pub cq: Arc<CqRing>,
    pub cq_history_list_size: u32,
    pub cos_id: Option<u8>,
}

/// Directed port creation; `queue_id` pairs the port with an existing directed queue.
#[derive(Clone, Debug)]
pub struct DirPortArgs {
    pub cq: Arc<CqRing>,
    pub queue_id: Option<u32>,
}

/// Hardware identity of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HwPort {
    Ldb(u32),
    Dir(u32),
}

/// Hardware identity of a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HwQueue {
    Ldb(u32),
    Dir(u32),
}
