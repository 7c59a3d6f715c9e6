//! In-memory model of the scheduling accelerator.
//!
//! The model keeps one scheduling domain at a time and reproduces the parts
//! of the device the core relies on:
//!
//! * atomic events pin their flow (`lock_id`) to the port that received the
//!   first event of the flow until every outstanding event of that flow has
//!   been completed;
//! * ordered and unordered events go to the eligible linked port with the best
//!   (lowest) link priority, round robin among equals;
//! * directed events go to the single port sharing the directed queue's id;
//! * a port is eligible while its CQ occupancy (entries written minus tokens
//!   returned) is below the CQ depth and, for load-balanced ports, while its
//!   history list has room;
//! * a completion retires the oldest history-list entry of the port;
//! * queued events drain whenever a token return, completion or new mapping
//!   makes a port eligible again.
//!
//! Every command word written by a port is recorded so tests can check the
//! exact order the device observed.

use crate::device::HwDevice;
use crate::status::{HwError, HwOp, HwResult, HwStatus};
use crate::types::{
    DeviceVersion, DirPortArgs, DirQueueArgs, DomainArgs, DomainId, HwPort, HwQueue, LdbPortArgs,
    LdbQueueArgs, ResourceCounts, NUM_COS, NUM_SN_GROUPS, SN_GROUP_CAPACITY,
};
use parking_lot::Mutex;
use qe_ring::{CqPollMode, CqRing, HwSchedType, Qe};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

const MAX_QIDS_PER_LDB_PORT: usize = 8;
const MAX_LINK_PRIORITY: u8 = 7;
const DEFAULT_SN_ALLOCATION: u32 = 64;

/// Static properties of a simulated device.
#[derive(Clone, Debug)]
pub struct SimConfig {
    pub version: DeviceVersion,
    pub poll_mode: CqPollMode,
    pub wait_for_write: bool,
    pub resources: ResourceCounts,
}

impl SimConfig {
    /// Second-generation device with split credit pools.
    pub fn v2() -> Self {
        Self {
            version: DeviceVersion::V2,
            poll_mode: CqPollMode::Standard,
            wait_for_write: false,
            resources: ResourceCounts {
                num_sched_domains: 32,
                num_ldb_queues: 32,
                num_ldb_ports: 64,
                num_cos_ldb_ports: [16; NUM_COS],
                num_dir_ports: 64,
                num_atomic_inflights: 2048,
                num_hist_list_entries: 2048,
                max_contiguous_hist_list_entries: 2048,
                num_ldb_credits: 8192,
                num_dir_credits: 2048,
                num_credits: 0,
            },
        }
    }

    /// Revision 2.5 with a single combined credit pool.
    pub fn v2_5() -> Self {
        let mut config = Self::v2();
        config.version = DeviceVersion::V2_5;
        config.resources.num_ldb_credits = 0;
        config.resources.num_dir_credits = 0;
        config.resources.num_credits = 16384;
        config
    }

    pub fn with_poll_mode(mut self, mode: CqPollMode) -> Self {
        self.poll_mode = mode;
        self
    }

    pub fn with_wait_for_write(mut self, enabled: bool) -> Self {
        self.wait_for_write = enabled;
        self
    }

    pub fn with_resources(mut self, resources: ResourceCounts) -> Self {
        self.resources = resources;
        self
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::v2()
    }
}

#[derive(Clone, Copy, Debug)]
struct SnGroup {
    allocation: u32,
    occupancy: u32,
}

impl SnGroup {
    fn slots(&self) -> u32 {
        SN_GROUP_CAPACITY / self.allocation
    }
}

#[derive(Clone, Copy, Debug)]
struct HistEntry {
    qid: u32,
    sched: HwSchedType,
    lock_id: u16,
}

#[derive(Debug)]
struct SimPort {
    cq: Arc<CqRing>,
    written: u64,
    tokens: u64,
    /// `None` for directed ports, which keep no history list.
    hist_limit: Option<usize>,
    hist: VecDeque<HistEntry>,
    cos: Option<u8>,
    links: usize,
}

impl SimPort {
    fn new(cq: Arc<CqRing>, hist_limit: Option<usize>, cos: Option<u8>) -> Self {
        Self {
            cq,
            written: 0,
            tokens: 0,
            hist_limit,
            hist: VecDeque::new(),
            cos,
            links: 0,
        }
    }

    fn occupancy(&self) -> u64 {
        self.written - self.tokens
    }

    fn eligible(&self) -> bool {
        self.occupancy() < u64::from(self.cq.depth())
            && self.hist_limit.map_or(true, |limit| self.hist.len() < limit)
    }

    fn return_tokens(&mut self, n: u32) {
        self.tokens = (self.tokens + u64::from(n)).min(self.written);
    }

    fn deliver(&mut self, qid: u32, qe: &Qe) {
        let out = Qe {
            payload: qe.payload,
            opaque: 0,
            qid: qid as u8,
            sched: qe.sched,
            priority: qe.priority,
            lock_id: qe.lock_id,
            status: 0,
            cmd: 0,
        };
        self.cq.publish(self.written, &out);
        self.written += 1;
        if self.hist_limit.is_some() {
            self.hist.push_back(HistEntry {
                qid,
                sched: qe.sched,
                lock_id: qe.lock_id,
            });
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Link {
    port: u32,
    priority: u8,
}

#[derive(Clone, Copy, Debug)]
struct FlowPin {
    port: u32,
    count: u32,
}

#[derive(Debug, Default)]
struct SimLdbQueue {
    sn_group: Option<usize>,
    backlog: VecDeque<Qe>,
    links: Vec<Link>,
    rr: usize,
    flows: HashMap<u16, FlowPin>,
}

impl SimLdbQueue {
    fn pick(&mut self, ports: &[SimPort]) -> Option<u32> {
        let best = self
            .links
            .iter()
            .filter(|link| ports[link.port as usize].eligible())
            .map(|link| link.priority)
            .min()?;
        let n = self.links.len();
        for step in 0..n {
            let idx = (self.rr + step) % n;
            let link = self.links[idx];
            if link.priority == best && ports[link.port as usize].eligible() {
                self.rr = (idx + 1) % n;
                return Some(link.port);
            }
        }
        None
    }

    fn drain(&mut self, qid: u32, ports: &mut [SimPort]) -> bool {
        let mut delivered = false;
        let mut blocked: HashSet<u16> = HashSet::new();
        let mut i = 0;
        while i < self.backlog.len() {
            let qe = self.backlog[i];
            let atomic = qe.sched == HwSchedType::Atomic;
            let target = if atomic {
                if blocked.contains(&qe.lock_id) {
                    None
                } else if let Some(pin) = self.flows.get(&qe.lock_id) {
                    ports[pin.port as usize].eligible().then_some(pin.port)
                } else {
                    self.pick(ports)
                }
            } else {
                self.pick(ports)
            };
            match target {
                Some(port) => {
                    self.backlog.remove(i);
                    ports[port as usize].deliver(qid, &qe);
                    if atomic {
                        self.flows
                            .entry(qe.lock_id)
                            .or_insert(FlowPin { port, count: 0 })
                            .count += 1;
                    }
                    delivered = true;
                }
                None => {
                    if atomic {
                        blocked.insert(qe.lock_id);
                    }
                    i += 1;
                }
            }
        }
        delivered
    }
}

#[derive(Debug)]
struct SimDomain {
    id: DomainId,
    args: DomainArgs,
    /// Ports drawn from each class to satisfy the request, returned on reset.
    taken_cos: [u32; NUM_COS],
    started: bool,
    generic_ports_left: u32,
    cos_ports_left: [u32; NUM_COS],
    atomic_left: u32,
    hist_left: u32,
    dir_ids: HashSet<u32>,
    ldb_queues: Vec<SimLdbQueue>,
    ldb_ports: Vec<SimPort>,
    dir_queues: BTreeMap<u32, VecDeque<Qe>>,
    dir_ports: BTreeMap<u32, SimPort>,
}

impl SimDomain {
    fn next_dir_id(&self) -> Option<u32> {
        (0..self.args.num_dir_ports).find(|id| !self.dir_ids.contains(id))
    }

    fn schedule(&mut self) {
        if !self.started {
            return;
        }
        loop {
            let mut progress = false;
            for (qid, queue) in self.ldb_queues.iter_mut().enumerate() {
                progress |= queue.drain(qid as u32, &mut self.ldb_ports);
            }
            for (qid, backlog) in self.dir_queues.iter_mut() {
                if let Some(port) = self.dir_ports.get_mut(qid) {
                    while port.eligible() {
                        let Some(qe) = backlog.pop_front() else {
                            break;
                        };
                        port.deliver(*qid, &qe);
                        progress = true;
                    }
                }
            }
            if !progress {
                break;
            }
        }
    }

    fn complete(&mut self, port: u32) {
        let Some(entry) = self.ldb_ports[port as usize].hist.pop_front() else {
            return;
        };
        if entry.sched != HwSchedType::Atomic {
            return;
        }
        if let Some(queue) = self.ldb_queues.get_mut(entry.qid as usize) {
            if let Some(pin) = queue.flows.get_mut(&entry.lock_id) {
                pin.count -= 1;
                if pin.count == 0 {
                    queue.flows.remove(&entry.lock_id);
                }
            }
        }
    }
}

#[derive(Debug)]
struct SimState {
    opened: bool,
    free: ResourceCounts,
    cos_bandwidth: [u8; NUM_COS],
    sn_groups: [SnGroup; NUM_SN_GROUPS],
    domain: Option<SimDomain>,
    next_domain_id: DomainId,
    log: HashMap<HwPort, Vec<Qe>>,
}

/// Software implementation of [`HwDevice`].
#[derive(Debug)]
pub struct SimDevice {
    config: SimConfig,
    state: Mutex<SimState>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

fn fail<T>(op: HwOp, status: HwStatus) -> HwResult<T> {
    Err(HwError::new(op, status))
}

impl SimDevice {
    pub fn new(config: SimConfig) -> Self {
        let free = config.resources;
        Self {
            config,
            state: Mutex::new(SimState {
                opened: false,
                free,
                cos_bandwidth: [25; NUM_COS],
                sn_groups: [SnGroup {
                    allocation: DEFAULT_SN_ALLOCATION,
                    occupancy: 0,
                }; NUM_SN_GROUPS],
                domain: None,
                next_domain_id: 0,
                log: HashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Every command word `port` has written since the domain was created.
    pub fn command_log(&self, port: HwPort) -> Vec<Qe> {
        self.state.lock().log.get(&port).cloned().unwrap_or_default()
    }

    pub fn clear_command_log(&self) {
        self.state.lock().log.clear();
    }

    /// CQ entries written to `port` and not yet handed back with tokens.
    pub fn cq_occupancy(&self, port: HwPort) -> Option<u64> {
        let state = self.state.lock();
        let domain = state.domain.as_ref()?;
        match port {
            HwPort::Ldb(id) => domain.ldb_ports.get(id as usize).map(SimPort::occupancy),
            HwPort::Dir(id) => domain.dir_ports.get(&id).map(SimPort::occupancy),
        }
    }

    /// Class-of-service the port was created with, if any.
    pub fn port_cos(&self, port: u32) -> Option<u8> {
        let state = self.state.lock();
        state.domain.as_ref()?.ldb_ports.get(port as usize)?.cos
    }

    pub fn cos_bandwidth(&self) -> [u8; NUM_COS] {
        self.state.lock().cos_bandwidth
    }

    /// Capacity granted to the live domain, if one exists.
    pub fn domain_args(&self) -> Option<DomainArgs> {
        self.state.lock().domain.as_ref().map(|d| d.args)
    }

    fn domain_mut(
        slot: &mut Option<SimDomain>,
        op: HwOp,
        domain: DomainId,
    ) -> HwResult<&mut SimDomain> {
        match slot.as_mut() {
            Some(d) if d.id == domain => Ok(d),
            Some(_) => fail(op, HwStatus::InvalidDomainId),
            None => fail(op, HwStatus::DomainNotConfigured),
        }
    }
}

impl HwDevice for SimDevice {
    fn open(&self, name: &str) -> HwResult<()> {
        log::debug!("sim device {name} opened ({:?})", self.config.version);
        self.state.lock().opened = true;
        Ok(())
    }

    fn device_version(&self) -> HwResult<DeviceVersion> {
        Ok(self.config.version)
    }

    fn poll_mode(&self) -> HwResult<CqPollMode> {
        Ok(self.config.poll_mode)
    }

    fn supports_wait_for_write(&self) -> bool {
        self.config.wait_for_write
    }

    fn query_resources(&self) -> HwResult<ResourceCounts> {
        let state = self.state.lock();
        if !state.opened {
            return fail(HwOp::QueryResources, HwStatus::DeviceNotOpen);
        }
        Ok(state.free)
    }

    fn set_cos_bandwidth(&self, cos: u8, percent: u8) -> HwResult<()> {
        let op = HwOp::SetCosBandwidth;
        if cos as usize >= NUM_COS {
            return fail(op, HwStatus::InvalidCosId);
        }
        let mut state = self.state.lock();
        let others: u32 = state
            .cos_bandwidth
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != cos as usize)
            .map(|(_, pct)| u32::from(*pct))
            .sum();
        if others + u32::from(percent) > 100 {
            return fail(op, HwStatus::InvalidCosBandwidth);
        }
        state.cos_bandwidth[cos as usize] = percent;
        Ok(())
    }

    fn create_domain(&self, args: &DomainArgs) -> HwResult<DomainId> {
        let op = HwOp::CreateDomain;
        let mut state = self.state.lock();
        if !state.opened {
            return fail(op, HwStatus::DeviceNotOpen);
        }
        if state.domain.is_some() || state.free.num_sched_domains == 0 {
            return fail(op, HwStatus::DomainUnavailable);
        }
        let free = state.free;
        if args.num_ldb_queues > free.num_ldb_queues {
            return fail(op, HwStatus::LdbQueuesUnavailable);
        }
        let mut classes = free.num_cos_ldb_ports;
        for (class, want) in args.num_cos_ldb_ports.iter().enumerate() {
            if *want > classes[class] {
                return fail(op, HwStatus::LdbPortsUnavailable);
            }
            classes[class] -= want;
        }
        let mut generic = args.num_ldb_ports;
        let mut taken_cos = args.num_cos_ldb_ports;
        for (class, left) in classes.iter_mut().enumerate() {
            let take = generic.min(*left);
            *left -= take;
            taken_cos[class] += take;
            generic -= take;
        }
        if generic > 0 {
            return fail(op, HwStatus::LdbPortsUnavailable);
        }
        if args.num_dir_ports > free.num_dir_ports {
            return fail(op, HwStatus::DirPortsUnavailable);
        }
        if args.num_atomic_inflights > free.num_atomic_inflights {
            return fail(op, HwStatus::AtomicInflightsUnavailable);
        }
        if args.num_hist_list_entries > free.num_hist_list_entries {
            return fail(op, HwStatus::HistListEntriesUnavailable);
        }
        if self.config.version.combined_credits() {
            if args.num_credits > free.num_credits {
                return fail(op, HwStatus::CreditsUnavailable);
            }
        } else {
            if args.num_ldb_credits > free.num_ldb_credits {
                return fail(op, HwStatus::LdbCreditsUnavailable);
            }
            if args.num_dir_credits > free.num_dir_credits {
                return fail(op, HwStatus::DirCreditsUnavailable);
            }
        }

        let id = state.next_domain_id;
        state.next_domain_id += 1;
        let free = &mut state.free;
        free.num_sched_domains -= 1;
        free.num_ldb_queues -= args.num_ldb_queues;
        free.num_cos_ldb_ports = classes;
        free.num_ldb_ports = classes.iter().sum();
        free.num_dir_ports -= args.num_dir_ports;
        free.num_atomic_inflights -= args.num_atomic_inflights;
        free.num_hist_list_entries -= args.num_hist_list_entries;
        free.max_contiguous_hist_list_entries = free.num_hist_list_entries;
        if self.config.version.combined_credits() {
            free.num_credits -= args.num_credits;
        } else {
            free.num_ldb_credits -= args.num_ldb_credits;
            free.num_dir_credits -= args.num_dir_credits;
        }
        state.log.clear();
        state.domain = Some(SimDomain {
            id,
            args: *args,
            taken_cos,
            started: false,
            generic_ports_left: args.num_ldb_ports,
            cos_ports_left: args.num_cos_ldb_ports,
            atomic_left: args.num_atomic_inflights,
            hist_left: args.num_hist_list_entries,
            dir_ids: HashSet::new(),
            ldb_queues: Vec::new(),
            ldb_ports: Vec::new(),
            dir_queues: BTreeMap::new(),
            dir_ports: BTreeMap::new(),
        });
        log::debug!("sim domain {id} created: {args:?}");
        Ok(id)
    }

    fn reset_domain(&self, domain: DomainId) -> HwResult<()> {
        let op = HwOp::ResetDomain;
        let mut state = self.state.lock();
        Self::domain_mut(&mut state.domain, op, domain)?;
        let Some(dom) = state.domain.take() else {
            return fail(op, HwStatus::DomainNotConfigured);
        };
        for queue in &dom.ldb_queues {
            if let Some(group) = queue.sn_group {
                state.sn_groups[group].occupancy -= 1;
            }
        }
        let args = dom.args;
        let free = &mut state.free;
        free.num_sched_domains += 1;
        free.num_ldb_queues += args.num_ldb_queues;
        for (class, taken) in dom.taken_cos.iter().enumerate() {
            free.num_cos_ldb_ports[class] += taken;
        }
        free.num_ldb_ports = free.num_cos_ldb_ports.iter().sum();
        free.num_dir_ports += args.num_dir_ports;
        free.num_atomic_inflights += args.num_atomic_inflights;
        free.num_hist_list_entries += args.num_hist_list_entries;
        free.max_contiguous_hist_list_entries = free.num_hist_list_entries;
        free.num_ldb_credits += args.num_ldb_credits;
        free.num_dir_credits += args.num_dir_credits;
        free.num_credits += args.num_credits;
        log::debug!("sim domain {domain} reset");
        Ok(())
    }

    fn start_domain(&self, domain: DomainId) -> HwResult<()> {
        let op = HwOp::StartDomain;
        let mut state = self.state.lock();
        let dom = Self::domain_mut(&mut state.domain, op, domain)?;
        if dom.started {
            return fail(op, HwStatus::DomainStarted);
        }
        dom.started = true;
        dom.schedule();
        Ok(())
    }

    fn create_ldb_queue(&self, domain: DomainId, args: &LdbQueueArgs) -> HwResult<u32> {
        let op = HwOp::CreateLdbQueue;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let dom = Self::domain_mut(&mut state.domain, op, domain)?;
        if dom.started {
            return fail(op, HwStatus::DomainStarted);
        }
        if dom.ldb_queues.len() as u32 >= dom.args.num_ldb_queues {
            return fail(op, HwStatus::LdbQueuesUnavailable);
        }
        if args.num_atomic_inflights > dom.atomic_left {
            return fail(op, HwStatus::AtomicInflightsUnavailable);
        }
        let mut sn_group = None;
        if args.num_sequence_numbers > 0 {
            let group = state.sn_groups.iter().position(|g| {
                g.allocation == args.num_sequence_numbers && g.occupancy < g.slots()
            });
            match group {
                Some(group) => sn_group = Some(group),
                None => return fail(op, HwStatus::SequenceNumbersUnavailable),
            }
        }
        if let Some(group) = sn_group {
            state.sn_groups[group].occupancy += 1;
        }
        dom.atomic_left -= args.num_atomic_inflights;
        dom.ldb_queues.push(SimLdbQueue {
            sn_group,
            ..SimLdbQueue::default()
        });
        Ok(dom.ldb_queues.len() as u32 - 1)
    }

    fn create_dir_queue(&self, domain: DomainId, args: &DirQueueArgs) -> HwResult<u32> {
        let op = HwOp::CreateDirQueue;
        let mut state = self.state.lock();
        let dom = Self::domain_mut(&mut state.domain, op, domain)?;
        let id = match args.port_id {
            Some(port) => {
                if !dom.dir_ports.contains_key(&port) {
                    return fail(op, HwStatus::InvalidPortId);
                }
                if dom.dir_queues.contains_key(&port) {
                    return fail(op, HwStatus::InvalidDirQueueId);
                }
                port
            }
            None => match dom.next_dir_id() {
                Some(id) => id,
                None => return fail(op, HwStatus::DirQueuesUnavailable),
            },
        };
        dom.dir_ids.insert(id);
        dom.dir_queues.insert(id, VecDeque::new());
        dom.schedule();
        Ok(id)
    }

    fn create_ldb_port(&self, domain: DomainId, args: LdbPortArgs) -> HwResult<u32> {
        let op = HwOp::CreateLdbPort;
        let mut state = self.state.lock();
        let dom = Self::domain_mut(&mut state.domain, op, domain)?;
        if dom.started {
            return fail(op, HwStatus::DomainStarted);
        }
        if args.cq_history_list_size == 0 || args.cq_history_list_size > dom.hist_left {
            return fail(op, HwStatus::HistListEntriesUnavailable);
        }
        if let Some(cos) = args.cos_id {
            if cos as usize >= NUM_COS {
                return fail(op, HwStatus::InvalidCosId);
            }
        }
        match args.cos_id {
            Some(cos) if dom.cos_ports_left[cos as usize] > 0 => {
                dom.cos_ports_left[cos as usize] -= 1;
            }
            _ if dom.generic_ports_left > 0 => dom.generic_ports_left -= 1,
            _ => {
                // Non-strict classes: fall back to any class with room left.
                match dom.cos_ports_left.iter().position(|left| *left > 0) {
                    Some(class) if !dom.args.cos_strict => dom.cos_ports_left[class] -= 1,
                    _ => return fail(op, HwStatus::LdbPortsUnavailable),
                }
            }
        }
        dom.hist_left -= args.cq_history_list_size;
        dom.ldb_ports.push(SimPort::new(
            args.cq,
            Some(args.cq_history_list_size as usize),
            args.cos_id,
        ));
        Ok(dom.ldb_ports.len() as u32 - 1)
    }

    fn create_dir_port(&self, domain: DomainId, args: DirPortArgs) -> HwResult<u32> {
        let op = HwOp::CreateDirPort;
        let mut state = self.state.lock();
        let dom = Self::domain_mut(&mut state.domain, op, domain)?;
        if dom.started {
            return fail(op, HwStatus::DomainStarted);
        }
        let id = match args.queue_id {
            Some(queue) => {
                if !dom.dir_queues.contains_key(&queue) || dom.dir_ports.contains_key(&queue) {
                    return fail(op, HwStatus::InvalidDirQueueId);
                }
                queue
            }
            None => match dom.next_dir_id() {
                Some(id) => id,
                None => return fail(op, HwStatus::DirPortsUnavailable),
            },
        };
        dom.dir_ids.insert(id);
        dom.dir_ports.insert(id, SimPort::new(args.cq, None, None));
        Ok(id)
    }

    fn map_qid(&self, domain: DomainId, port: u32, qid: u32, priority: u8) -> HwResult<()> {
        let op = HwOp::MapQid;
        let mut state = self.state.lock();
        let dom = Self::domain_mut(&mut state.domain, op, domain)?;
        if port as usize >= dom.ldb_ports.len() {
            return fail(op, HwStatus::InvalidPortId);
        }
        if priority > MAX_LINK_PRIORITY {
            return fail(op, HwStatus::InvalidPriority);
        }
        let Some(queue) = dom.ldb_queues.get_mut(qid as usize) else {
            return fail(op, HwStatus::InvalidQid);
        };
        if let Some(link) = queue.links.iter_mut().find(|l| l.port == port) {
            link.priority = priority;
        } else {
            if dom.ldb_ports[port as usize].links >= MAX_QIDS_PER_LDB_PORT {
                return fail(op, HwStatus::NoQidSlotsAvailable);
            }
            queue.links.push(Link { port, priority });
            dom.ldb_ports[port as usize].links += 1;
        }
        dom.schedule();
        Ok(())
    }

    fn unmap_qid(&self, domain: DomainId, port: u32, qid: u32) -> HwResult<()> {
        let op = HwOp::UnmapQid;
        let mut state = self.state.lock();
        let dom = Self::domain_mut(&mut state.domain, op, domain)?;
        if port as usize >= dom.ldb_ports.len() {
            return fail(op, HwStatus::InvalidPortId);
        }
        let Some(queue) = dom.ldb_queues.get_mut(qid as usize) else {
            return fail(op, HwStatus::InvalidQid);
        };
        let Some(pos) = queue.links.iter().position(|l| l.port == port) else {
            return fail(op, HwStatus::QidNotMapped);
        };
        queue.links.remove(pos);
        queue.rr = 0;
        dom.ldb_ports[port as usize].links -= 1;
        Ok(())
    }

    fn sn_allocation(&self, group: u32) -> HwResult<u32> {
        let state = self.state.lock();
        match state.sn_groups.get(group as usize) {
            Some(g) => Ok(g.allocation),
            None => fail(HwOp::SnAllocation, HwStatus::InvalidSnGroup),
        }
    }

    fn set_sn_allocation(&self, group: u32, num: u32) -> HwResult<()> {
        let op = HwOp::SetSnAllocation;
        if !num.is_power_of_two() || !(64..=SN_GROUP_CAPACITY).contains(&num) {
            return fail(op, HwStatus::InvalidSnAllocation);
        }
        let mut state = self.state.lock();
        let Some(g) = state.sn_groups.get_mut(group as usize) else {
            return fail(op, HwStatus::InvalidSnGroup);
        };
        if g.occupancy > 0 {
            return fail(op, HwStatus::SnGroupInUse);
        }
        g.allocation = num;
        Ok(())
    }

    fn sn_occupancy(&self, group: u32) -> HwResult<u32> {
        let state = self.state.lock();
        match state.sn_groups.get(group as usize) {
            Some(g) => Ok(g.occupancy),
            None => fail(HwOp::SnOccupancy, HwStatus::InvalidSnGroup),
        }
    }

    fn queue_depth(&self, domain: DomainId, queue: HwQueue) -> HwResult<u32> {
        let op = HwOp::QueueDepth;
        let mut state = self.state.lock();
        let dom = Self::domain_mut(&mut state.domain, op, domain)?;
        match queue {
            HwQueue::Ldb(qid) => match dom.ldb_queues.get(qid as usize) {
                Some(q) => Ok(q.backlog.len() as u32),
                None => fail(op, HwStatus::InvalidQid),
            },
            HwQueue::Dir(qid) => match dom.dir_queues.get(&qid) {
                Some(q) => Ok(q.len() as u32),
                None => fail(op, HwStatus::InvalidDirQueueId),
            },
        }
    }

    fn enqueue(&self, port: HwPort, qes: &[Qe]) -> HwResult<()> {
        let op = HwOp::Enqueue;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let dom = match state.domain.as_mut() {
            Some(d) if d.started => d,
            Some(_) => return fail(op, HwStatus::DomainNotStarted),
            None => return fail(op, HwStatus::DomainNotConfigured),
        };
        let exists = match port {
            HwPort::Ldb(id) => (id as usize) < dom.ldb_ports.len(),
            HwPort::Dir(id) => dom.dir_ports.contains_key(&id),
        };
        if !exists {
            return fail(op, HwStatus::InvalidPortId);
        }
        for qe in qes.iter().filter(|qe| qe.is_valid_event()) {
            let known = if qe.sched == HwSchedType::Directed {
                dom.dir_queues.contains_key(&u32::from(qe.qid))
            } else {
                (qe.qid as usize) < dom.ldb_queues.len()
            };
            if !known {
                return fail(op, HwStatus::InvalidQid);
            }
        }
        state.log.entry(port).or_default().extend_from_slice(qes);

        for qe in qes {
            let tokens = qe.tokens_returned();
            match port {
                HwPort::Ldb(id) => {
                    dom.ldb_ports[id as usize].return_tokens(tokens);
                    if qe.is_completion() {
                        dom.complete(id);
                    }
                }
                HwPort::Dir(id) => {
                    if let Some(p) = dom.dir_ports.get_mut(&id) {
                        p.return_tokens(tokens);
                    }
                }
            }
            if qe.is_valid_event() {
                if qe.sched == HwSchedType::Directed {
                    if let Some(backlog) = dom.dir_queues.get_mut(&u32::from(qe.qid)) {
                        backlog.push_back(*qe);
                    }
                } else if let Some(queue) = dom.ldb_queues.get_mut(qe.qid as usize) {
                    queue.backlog.push_back(*qe);
                }
            }
        }
        dom.schedule();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qe_ring::{cmd, CqCursor};

    fn ring(depth: u32) -> Arc<CqRing> {
        Arc::new(CqRing::new(depth, CqPollMode::Standard).expect("cq ring"))
    }

    fn small_domain() -> DomainArgs {
        DomainArgs {
            num_ldb_queues: 2,
            num_ldb_ports: 2,
            num_dir_ports: 1,
            num_atomic_inflights: 128,
            num_hist_list_entries: 64,
            num_ldb_credits: 256,
            num_dir_credits: 64,
            ..DomainArgs::default()
        }
    }

    fn opened(config: SimConfig) -> SimDevice {
        let dev = SimDevice::new(config);
        dev.open("sim0").expect("open");
        dev
    }

    fn new_event(qid: u8, sched: HwSchedType, flow: u16, payload: u64) -> Qe {
        Qe {
            payload,
            qid,
            sched,
            lock_id: flow,
            cmd: cmd::NEW,
            ..Qe::default()
        }
    }

    fn drain(cq: &CqRing, cursor: &mut CqCursor) -> Vec<Qe> {
        let mut out = Vec::new();
        let mut buf = [Qe::default(); 4];
        loop {
            let n = cq.poll(cursor, &mut buf);
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    /// Domain creation consumes resources and reset returns every one of them.
    #[test]
    fn domain_resources_round_trip() {
        let dev = opened(SimConfig::v2());
        let before = dev.query_resources().unwrap();
        let id = dev.create_domain(&small_domain()).unwrap();
        let during = dev.query_resources().unwrap();
        assert_eq!(during.num_ldb_queues, before.num_ldb_queues - 2);
        assert_eq!(during.num_ldb_ports, before.num_ldb_ports - 2);
        assert_eq!(during.num_ldb_credits, before.num_ldb_credits - 256);
        assert_eq!(
            dev.create_domain(&small_domain()).unwrap_err().status,
            HwStatus::DomainUnavailable
        );
        dev.reset_domain(id).unwrap();
        assert_eq!(dev.query_resources().unwrap(), before);
    }

    #[test]
    fn oversized_requests_report_status() {
        let dev = opened(SimConfig::v2_5());
        let args = DomainArgs {
            num_credits: 1 << 20,
            ..small_domain()
        };
        let err = dev.create_domain(&args).unwrap_err();
        assert_eq!(err.op, HwOp::CreateDomain);
        assert_eq!(err.status, HwStatus::CreditsUnavailable);

        let closed = SimDevice::default();
        assert_eq!(
            closed.query_resources().unwrap_err().status,
            HwStatus::DeviceNotOpen
        );
    }

    /// Atomic flows stay on one port until their events complete.
    #[test]
    fn atomic_flow_is_pinned_until_completion() {
        let dev = opened(SimConfig::v2());
        let dom = dev.create_domain(&small_domain()).unwrap();
        let q = dev
            .create_ldb_queue(dom, &LdbQueueArgs::default())
            .unwrap();
        let (cq0, cq1) = (ring(8), ring(8));
        let p0 = dev
            .create_ldb_port(dom, LdbPortArgs { cq: cq0.clone(), cq_history_list_size: 8, cos_id: None })
            .unwrap();
        let p1 = dev
            .create_ldb_port(dom, LdbPortArgs { cq: cq1.clone(), cq_history_list_size: 8, cos_id: None })
            .unwrap();
        dev.map_qid(dom, p0, q, 0).unwrap();
        dev.map_qid(dom, p1, q, 0).unwrap();
        dev.start_domain(dom).unwrap();

        let burst: Vec<Qe> = (0..4)
            .map(|i| new_event(q as u8, HwSchedType::Atomic, 7, i))
            .collect();
        dev.enqueue(HwPort::Ldb(p0), &burst).unwrap();

        let (mut c0, mut c1) = (CqCursor::new(8), CqCursor::new(8));
        let got0 = drain(&cq0, &mut c0);
        let got1 = drain(&cq1, &mut c1);
        assert_eq!(got0.len() + got1.len(), 4);
        assert!(got0.is_empty() || got1.is_empty(), "flow split across ports");

        let (holder, other_ring, other_cursor) = if got0.is_empty() {
            (p1, &cq0, &mut c0)
        } else {
            (p0, &cq1, &mut c1)
        };
        // Return tokens and complete everything; the flow may now move.
        let mut release = vec![Qe::token_return(4)];
        release.extend((0..4).map(|_| Qe { cmd: cmd::COMP, ..Qe::default() }));
        dev.enqueue(HwPort::Ldb(holder), &release).unwrap();
        dev.enqueue(HwPort::Ldb(holder), &[new_event(q as u8, HwSchedType::Atomic, 7, 99)])
            .unwrap();
        let moved = drain(other_ring, other_cursor);
        assert_eq!(moved.len(), 1, "unpinned flow continues round robin");
        assert_eq!(moved[0].payload, 99);
    }

    /// A full CQ holds events back until tokens come home.
    #[test]
    fn cq_occupancy_limits_delivery() {
        let dev = opened(SimConfig::v2());
        let dom = dev.create_domain(&small_domain()).unwrap();
        let q = dev.create_ldb_queue(dom, &LdbQueueArgs::default()).unwrap();
        let cq = ring(8);
        let p = dev
            .create_ldb_port(dom, LdbPortArgs { cq: cq.clone(), cq_history_list_size: 32, cos_id: None })
            .unwrap();
        dev.map_qid(dom, p, q, 0).unwrap();
        dev.start_domain(dom).unwrap();

        let burst: Vec<Qe> = (0..12)
            .map(|i| new_event(q as u8, HwSchedType::Unordered, 0, i))
            .collect();
        dev.enqueue(HwPort::Ldb(p), &burst).unwrap();
        assert_eq!(dev.cq_occupancy(HwPort::Ldb(p)), Some(8));
        assert_eq!(dev.queue_depth(dom, HwQueue::Ldb(q)).unwrap(), 4);

        let mut cursor = CqCursor::new(8);
        assert_eq!(drain(&cq, &mut cursor).len(), 8);
        dev.enqueue(HwPort::Ldb(p), &[Qe::token_return(8)]).unwrap();
        let rest = drain(&cq, &mut cursor);
        assert_eq!(rest.iter().map(|qe| qe.payload).collect::<Vec<_>>(), vec![8, 9, 10, 11]);
        assert_eq!(dev.queue_depth(dom, HwQueue::Ldb(q)).unwrap(), 0);
    }

    /// The history list bounds uncompleted events even when the CQ has room.
    #[test]
    fn history_list_limits_delivery() {
        let dev = opened(SimConfig::v2());
        let dom = dev.create_domain(&small_domain()).unwrap();
        let q = dev.create_ldb_queue(dom, &LdbQueueArgs::default()).unwrap();
        let cq = ring(16);
        let p = dev
            .create_ldb_port(dom, LdbPortArgs { cq: cq.clone(), cq_history_list_size: 2, cos_id: None })
            .unwrap();
        dev.map_qid(dom, p, q, 0).unwrap();
        dev.start_domain(dom).unwrap();
        let burst: Vec<Qe> = (0..3)
            .map(|i| new_event(q as u8, HwSchedType::Ordered, 0, i))
            .collect();
        dev.enqueue(HwPort::Ldb(p), &burst).unwrap();
        assert_eq!(dev.cq_occupancy(HwPort::Ldb(p)), Some(2));
        dev.enqueue(HwPort::Ldb(p), &[Qe { cmd: cmd::COMP_T, ..Qe::default() }])
            .unwrap();
        assert_eq!(dev.cq_occupancy(HwPort::Ldb(p)), Some(2));
        assert_eq!(dev.queue_depth(dom, HwQueue::Ldb(q)).unwrap(), 0);
    }

    /// Lower link priority values win; equal priorities alternate.
    #[test]
    fn link_priority_then_round_robin() {
        let dev = opened(SimConfig::v2());
        let args = DomainArgs { num_ldb_ports: 3, ..small_domain() };
        let dom = dev.create_domain(&args).unwrap();
        let q = dev.create_ldb_queue(dom, &LdbQueueArgs::default()).unwrap();
        let rings: Vec<_> = (0..3).map(|_| ring(8)).collect();
        let ports: Vec<u32> = rings
            .iter()
            .map(|cq| {
                dev.create_ldb_port(dom, LdbPortArgs { cq: cq.clone(), cq_history_list_size: 8, cos_id: None })
                    .unwrap()
            })
            .collect();
        dev.map_qid(dom, ports[0], q, 4).unwrap();
        dev.map_qid(dom, ports[1], q, 1).unwrap();
        dev.map_qid(dom, ports[2], q, 1).unwrap();
        dev.start_domain(dom).unwrap();
        let burst: Vec<Qe> = (0..4)
            .map(|i| new_event(q as u8, HwSchedType::Unordered, 0, i))
            .collect();
        dev.enqueue(HwPort::Ldb(ports[0]), &burst).unwrap();
        assert_eq!(dev.cq_occupancy(HwPort::Ldb(ports[0])), Some(0));
        assert_eq!(dev.cq_occupancy(HwPort::Ldb(ports[1])), Some(2));
        assert_eq!(dev.cq_occupancy(HwPort::Ldb(ports[2])), Some(2));
    }

    #[test]
    fn directed_queue_delivers_to_paired_port() {
        let dev = opened(SimConfig::v2());
        let dom = dev.create_domain(&small_domain()).unwrap();
        let cq = ring(8);
        let port = dev
            .create_dir_port(dom, DirPortArgs { cq: cq.clone(), queue_id: None })
            .unwrap();
        let queue = dev
            .create_dir_queue(dom, &DirQueueArgs { port_id: Some(port), depth_threshold: 0 })
            .unwrap();
        assert_eq!(queue, port);
        assert_eq!(
            dev.create_dir_queue(dom, &DirQueueArgs { port_id: None, depth_threshold: 0 })
                .unwrap_err()
                .status,
            HwStatus::DirQueuesUnavailable
        );
        dev.start_domain(dom).unwrap();
        dev.enqueue(HwPort::Dir(port), &[new_event(queue as u8, HwSchedType::Directed, 0, 5)])
            .unwrap();
        let mut cursor = CqCursor::new(8);
        let got = drain(&cq, &mut cursor);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].sched, HwSchedType::Directed);
        assert_eq!(got[0].payload, 5);
    }

    #[test]
    fn unmap_of_unmapped_pair_reports_not_mapped() {
        let dev = opened(SimConfig::v2());
        let dom = dev.create_domain(&small_domain()).unwrap();
        let q = dev.create_ldb_queue(dom, &LdbQueueArgs::default()).unwrap();
        let p = dev
            .create_ldb_port(dom, LdbPortArgs { cq: ring(8), cq_history_list_size: 8, cos_id: None })
            .unwrap();
        let err = dev.unmap_qid(dom, p, q).unwrap_err();
        assert_eq!(err.status, HwStatus::QidNotMapped);
        assert_eq!(
            dev.map_qid(dom, p, q, 9).unwrap_err().status,
            HwStatus::InvalidPriority
        );
    }

    /// Sequence-number groups can only be re-sized while empty.
    #[test]
    fn sn_groups_track_occupancy() {
        let dev = opened(SimConfig::v2());
        let dom = dev.create_domain(&small_domain()).unwrap();
        dev.set_sn_allocation(1, 512).unwrap();
        let args = LdbQueueArgs { num_sequence_numbers: 512, ..LdbQueueArgs::default() };
        dev.create_ldb_queue(dom, &args).unwrap();
        assert_eq!(dev.sn_occupancy(1).unwrap(), 1);
        assert_eq!(
            dev.set_sn_allocation(1, 1024).unwrap_err().status,
            HwStatus::SnGroupInUse
        );
        let args = LdbQueueArgs { num_sequence_numbers: 256, ..LdbQueueArgs::default() };
        assert_eq!(
            dev.create_ldb_queue(dom, &args).unwrap_err().status,
            HwStatus::SequenceNumbersUnavailable
        );
        dev.reset_domain(dom).unwrap();
        assert_eq!(dev.sn_occupancy(1).unwrap(), 0);
    }
}
