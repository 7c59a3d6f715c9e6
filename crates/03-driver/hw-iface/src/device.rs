use crate::status::HwResult;
use crate::types::{
    DeviceVersion, DirPortArgs, DirQueueArgs, DomainArgs, DomainId, HwPort, HwQueue, LdbPortArgs,
    LdbQueueArgs, ResourceCounts,
};
use qe_ring::{CqPollMode, Qe};

/// Operations the scheduling core needs from the accelerator.
///
/// Implementations are shared by every port thread; configuration calls are
/// serialised by the caller's domain lock, while [`HwDevice::enqueue`] is
/// called concurrently from the data path.
pub trait HwDevice: Send + Sync {
    /// Opens the named device instance.
    fn open(&self, name: &str) -> HwResult<()>;

    fn device_version(&self) -> HwResult<DeviceVersion>;

    /// Layout the device uses when writing consumer queues.
    fn poll_mode(&self) -> HwResult<CqPollMode>;

    /// Whether the platform can park a thread until the device writes a CQ line.
    fn supports_wait_for_write(&self) -> bool;

    /// Resources not currently owned by any domain.
    fn query_resources(&self) -> HwResult<ResourceCounts>;

    fn set_cos_bandwidth(&self, cos: u8, percent: u8) -> HwResult<()>;

    fn create_domain(&self, args: &DomainArgs) -> HwResult<DomainId>;

    /// Tears the domain down and returns all of its resources to the device.
    fn reset_domain(&self, domain: DomainId) -> HwResult<()>;

    fn start_domain(&self, domain: DomainId) -> HwResult<()>;

    fn create_ldb_queue(&self, domain: DomainId, args: &LdbQueueArgs) -> HwResult<u32>;

    fn create_dir_queue(&self, domain: DomainId, args: &DirQueueArgs) -> HwResult<u32>;

    fn create_ldb_port(&self, domain: DomainId, args: LdbPortArgs) -> HwResult<u32>;

    fn create_dir_port(&self, domain: DomainId, args: DirPortArgs) -> HwResult<u32>;

    fn map_qid(&self, domain: DomainId, port: u32, qid: u32, priority: u8) -> HwResult<()>;

    /// Fails with `QidNotMapped` when the pair is not mapped.
    fn unmap_qid(&self, domain: DomainId, port: u32, qid: u32) -> HwResult<()>;

    /// Sequence numbers per queue configured for `group`.
    fn sn_allocation(&self, group: u32) -> HwResult<u32>;

    fn set_sn_allocation(&self, group: u32, num: u32) -> HwResult<()>;

    /// Number of ordered queues currently drawing on `group`.
    fn sn_occupancy(&self, group: u32) -> HwResult<u32>;

    /// Events waiting in the queue for a consumer.
    fn queue_depth(&self, domain: DomainId, queue: HwQueue) -> HwResult<u32>;

    /// Bulk write of command words from a producer port.
    fn enqueue(&self, port: HwPort, qes: &[Qe]) -> HwResult<()>;
}
