//! Device limits and tuning defaults.

pub use hw_iface::{NUM_COS, NUM_SN_GROUPS, SN_GROUP_CAPACITY};
pub use qe_ring::{MAX_CQ_DEPTH, MIN_CQ_DEPTH, QE_BATCH};

pub const MAX_LDB_QUEUES: u32 = 32;
pub const MAX_LDB_PORTS: u32 = 64;
pub const MAX_DIR_PORTS: u32 = 64;
pub const MAX_EVENT_QUEUES: u32 = MAX_LDB_QUEUES + MAX_DIR_PORTS;
pub const MAX_EVENT_PORTS: u32 = MAX_LDB_PORTS + MAX_DIR_PORTS;

pub const MAX_NUM_FLOWS: u32 = 64 * 1024;
pub const MAX_ENQUEUE_DEPTH: u32 = 64;
pub const MAX_LINKS_PER_LDB_PORT: usize = 8;
pub const QID_PRIORITIES: u8 = 8;
/// Event priorities are 0..=255; the device keeps the top three bits.
pub const PRIORITY_SHIFT: u8 = 5;

pub const MAX_LDB_CREDITS: u32 = 8192;
pub const MAX_DIR_CREDITS: u32 = 2048;
pub const MAX_COMBINED_CREDITS: u32 = 16384;

pub const NUM_ATOMIC_INFLIGHTS_PER_QUEUE: u32 = 64;
pub const DEFAULT_HIST_LIST_PER_LDB_PORT: u32 = 32;
pub const MIN_SN_ALLOCATION: u32 = 64;

pub const DEFAULT_SW_CREDIT_QUANTA: u32 = 32;
pub const DEFAULT_PRODUCER_SW_CREDIT_QUANTA: u32 = 256;
pub const DEFAULT_CONSUMER_SW_CREDIT_QUANTA: u32 = 256;
pub const DEFAULT_HW_CREDIT_QUANTA: u32 = 32;

pub const DEFAULT_DEPTH_THRESHOLD: u32 = 256;
pub const MAX_DEPTH_THRESHOLD: u32 = 8192;
pub const DEFAULT_ENQUEUE_RETRIES: u32 = 16;

/// Consecutive empty dequeues after which a port hands back its cached credits.
pub const ZERO_DEQUEUE_CREDIT_RETURN_THRES: u32 = 16384;
/// Consecutive short enqueues after which a port hands back its cached credits.
pub const ENQUEUE_FAIL_CREDIT_RETURN_THRES: u32 = 100;

pub const UNMAPPED_QID: u8 = 0xFF;
