use thiserror::Error;

pub type HwResult<T> = Result<T, HwError>;

/// Status codes returned by the device driver alongside a failed request.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HwStatus {
    Success = 0,
    DeviceNotOpen,
    DomainUnavailable,
    LdbPortsUnavailable,
    DirPortsUnavailable,
    LdbQueuesUnavailable,
    LdbCreditsUnavailable,
    DirCreditsUnavailable,
    CreditsUnavailable,
    SequenceNumbersUnavailable,
    InvalidDomainId,
    AtomicInflightsUnavailable,
    HistListEntriesUnavailable,
    InvalidLdbQueueId,
    InvalidCqDepth,
    InvalidPortId,
    InvalidQid,
    InvalidPriority,
    NoQidSlotsAvailable,
    InvalidDirQueueId,
    DirQueuesUnavailable,
    DomainNotConfigured,
    DomainStarted,
    DomainNotStarted,
    QidNotMapped,
    InvalidSnGroup,
    InvalidSnAllocation,
    SnGroupInUse,
    InvalidCosId,
    InvalidCosBandwidth,
    InternalError,
}

impl HwStatus {
    /// Vendor string reported with the status.
    pub const fn as_str(self) -> &'static str {
        match self {
            HwStatus::Success => "DLB2_ST_SUCCESS",
            HwStatus::DeviceNotOpen => "DLB2_ST_DEVICE_NOT_OPEN",
            HwStatus::DomainUnavailable => "DLB2_ST_DOMAIN_UNAVAILABLE",
            HwStatus::LdbPortsUnavailable => "DLB2_ST_LDB_PORTS_UNAVAILABLE",
            HwStatus::DirPortsUnavailable => "DLB2_ST_DIR_PORTS_UNAVAILABLE",
            HwStatus::LdbQueuesUnavailable => "DLB2_ST_LDB_QUEUES_UNAVAILABLE",
            HwStatus::LdbCreditsUnavailable => "DLB2_ST_LDB_CREDITS_UNAVAILABLE",
            HwStatus::DirCreditsUnavailable => "DLB2_ST_DIR_CREDITS_UNAVAILABLE",
            HwStatus::CreditsUnavailable => "DLB2_ST_CREDITS_UNAVAILABLE",
            HwStatus::SequenceNumbersUnavailable => "DLB2_ST_SEQUENCE_NUMBERS_UNAVAILABLE",
            HwStatus::InvalidDomainId => "DLB2_ST_INVALID_DOMAIN_ID",
            HwStatus::AtomicInflightsUnavailable => "DLB2_ST_ATOMIC_INFLIGHTS_UNAVAILABLE",
            HwStatus::HistListEntriesUnavailable => "DLB2_ST_HIST_LIST_ENTRIES_UNAVAILABLE",
            HwStatus::InvalidLdbQueueId => "DLB2_ST_INVALID_LDB_QUEUE_ID",
            HwStatus::InvalidCqDepth => "DLB2_ST_INVALID_CQ_DEPTH",
            HwStatus::InvalidPortId => "DLB2_ST_INVALID_PORT_ID",
            HwStatus::InvalidQid => "DLB2_ST_INVALID_QID",
            HwStatus::InvalidPriority => "DLB2_ST_INVALID_PRIORITY",
            HwStatus::NoQidSlotsAvailable => "DLB2_ST_NO_QID_SLOTS_AVAILABLE",
            HwStatus::InvalidDirQueueId => "DLB2_ST_INVALID_DIR_QUEUE_ID",
            HwStatus::DirQueuesUnavailable => "DLB2_ST_DIR_QUEUES_UNAVAILABLE",
            HwStatus::DomainNotConfigured => "DLB2_ST_DOMAIN_NOT_CONFIGURED",
            HwStatus::DomainStarted => "DLB2_ST_DOMAIN_STARTED",
            HwStatus::DomainNotStarted => "DLB2_ST_DOMAIN_NOT_STARTED",
            HwStatus::QidNotMapped => "DLB2_ST_QID_NOT_MAPPED",
            HwStatus::InvalidSnGroup => "DLB2_ST_INVALID_SN_GROUP",
            HwStatus::InvalidSnAllocation => "DLB2_ST_INVALID_SN_ALLOCATION",
            HwStatus::SnGroupInUse => "DLB2_ST_SN_GROUP_IN_USE",
            HwStatus::InvalidCosId => "DLB2_ST_INVALID_COS_ID",
            HwStatus::InvalidCosBandwidth => "DLB2_ST_INVALID_COS_BANDWIDTH",
            HwStatus::InternalError => "DLB2_ST_INTERNAL_ERROR",
        }
    }

    pub const fn code(self) -> u32 {
        self as u32
    }
}

/// Boundary operation that produced a status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HwOp {
    Open,
    DeviceVersion,
    PollMode,
    QueryResources,
    SetCosBandwidth,
    CreateDomain,
    ResetDomain,
    StartDomain,
    CreateLdbQueue,
    CreateDirQueue,
    CreateLdbPort,
    CreateDirPort,
    MapQid,
    UnmapQid,
    SnAllocation,
    SetSnAllocation,
    SnOccupancy,
    QueueDepth,
    Enqueue,
}

impl HwOp {
    pub const fn name(self) -> &'static str {
        match self {
            HwOp::Open => "open",
            HwOp::DeviceVersion => "get_device_version",
            HwOp::PollMode => "get_cq_poll_mode",
            HwOp::QueryResources => "get_num_resources",
            HwOp::SetCosBandwidth => "set_cos_bandwidth",
            HwOp::CreateDomain => "sched_domain_create",
            HwOp::ResetDomain => "domain_reset",
            HwOp::StartDomain => "sched_domain_start",
            HwOp::CreateLdbQueue => "ldb_queue_create",
            HwOp::CreateDirQueue => "dir_queue_create",
            HwOp::CreateLdbPort => "ldb_port_create",
            HwOp::CreateDirPort => "dir_port_create",
            HwOp::MapQid => "map_qid",
            HwOp::UnmapQid => "unmap_qid",
            HwOp::SnAllocation => "get_sn_allocation",
            HwOp::SetSnAllocation => "set_sn_allocation",
            HwOp::SnOccupancy => "get_sn_occupancy",
            HwOp::QueueDepth => "get_queue_depth",
            HwOp::Enqueue => "enqueue",
        }
    }
}

impl std::fmt::Display for HwOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A boundary call that the device rejected.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("{op} failed, status {code}: {text}", code = .status.code(), text = .status.as_str())]
pub struct HwError {
    pub op: HwOp,
    pub status: HwStatus,
}

impl HwError {
    pub const fn new(op: HwOp, status: HwStatus) -> Self {
        Self { op, status }
    }

    /// Logs the rejection with the vendor status string and returns the error.
    pub fn logged(self) -> Self {
        log::error!(
            "{} failed, status {} ({})",
            self.op,
            self.status.code(),
            self.status.as_str()
        );
        self
    }
}
