//! Scheduling-domain lifecycle and the resource manager.
//!
//! [`EventDev`] owns the configuration side of one device: it carves the
//! hardware capacity into a domain, tracks every queue and port record, and
//! drives the `Unconfigured → Configured → Started → Stopped` state machine.
//! All of it sits behind a single mutex; the data path only ever sees the
//! [`DomainShared`] block of the hardware domain it was claimed from.

use crate::config::{DevArgs, DomainConfig};
use crate::consts::*;
use crate::cos::{self, CosPlan};
use crate::credit::{CreditKind, CreditPools, PoolLevel, SwCredits};
use crate::error::{hw_err, EvError, EvResult};
use crate::port::PortRecord;
use crate::queue::QueueRecord;
use hw_iface::{DeviceVersion, DomainArgs, DomainId, HwDevice, HwQueue, ResourceCounts};
use parking_lot::Mutex;
use qe_ring::CqPollMode;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Device lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DevState {
    #[default]
    Unconfigured,
    Configured,
    Started,
    Stopped,
}

impl fmt::Display for DevState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DevState::Unconfigured => "unconfigured",
            DevState::Configured => "configured",
            DevState::Started => "started",
            DevState::Stopped => "stopped",
        })
    }
}

/// Setup state of a queue or port record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConfigState {
    #[default]
    NotConfigured,
    Configured,
    /// Set up before the last reset; recreated with the same settings on start.
    PrevConfigured,
}

impl ConfigState {
    pub fn has_config(self) -> bool {
        !matches!(self, ConfigState::NotConfigured)
    }
}

/// Limits reported to the application before it configures the device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevInfo {
    pub driver_name: String,
    pub version: DeviceVersion,
    pub max_event_queues: u32,
    pub max_event_ports: u32,
    pub max_single_link_event_port_queue_pairs: u32,
    pub max_event_queue_flows: u32,
    pub max_event_queue_priority_levels: u8,
    pub max_event_port_dequeue_depth: u32,
    pub max_event_port_enqueue_depth: u32,
    pub max_event_port_links: u32,
    pub max_num_events: u32,
}

/// Point-in-time view of the domain's credit counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreditSnapshot {
    pub inflights: u32,
    pub new_event_limit: u32,
    pub pools: SmallVec<[PoolLevel; 2]>,
}

impl CreditSnapshot {
    pub fn pool(&self, kind: CreditKind) -> Option<PoolLevel> {
        self.pools.iter().copied().find(|p| p.kind == kind)
    }
}

/// Everything the data path of one hardware domain shares.
///
/// A new block is built whenever the hardware domain is (re)created; ports
/// claimed from an older block see `live == false` and refuse to run.
pub(crate) struct DomainShared<H: HwDevice> {
    pub hw: Arc<H>,
    pub domain_id: DomainId,
    pub live: AtomicBool,
    pub pools: CreditPools,
    pub sw: SwCredits,
}

impl<H: HwDevice> DomainShared<H> {
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

impl<H: HwDevice> fmt::Debug for DomainShared<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainShared")
            .field("domain_id", &self.domain_id)
            .field("live", &self.is_live())
            .field("pools", &self.pools)
            .field("sw", &self.sw)
            .finish()
    }
}

pub(crate) struct DomainState<H: HwDevice> {
    pub dev: DevState,
    pub config: Option<DomainConfig>,
    pub hw_args: Option<DomainArgs>,
    pub shared: Option<Arc<DomainShared<H>>>,
    pub queues: Vec<QueueRecord>,
    pub ports: Vec<PortRecord>,
}

impl<H: HwDevice> DomainState<H> {
    fn empty() -> Self {
        Self {
            dev: DevState::Unconfigured,
            config: None,
            hw_args: None,
            shared: None,
            queues: Vec::new(),
            ports: Vec::new(),
        }
    }

    /// Queue and port setup and linking happen between configure and start.
    pub fn require_setup(&self, op: &'static str) -> EvResult<()> {
        match self.dev {
            DevState::Configured | DevState::Stopped => Ok(()),
            state => Err(EvError::InvalidState { op, state }),
        }
    }

    pub fn require_config(&self, op: &'static str) -> EvResult<&DomainConfig> {
        match (&self.config, self.dev) {
            (Some(cfg), DevState::Configured | DevState::Started | DevState::Stopped) => Ok(cfg),
            (_, state) => Err(EvError::InvalidState { op, state }),
        }
    }

    pub fn live_shared(&self, op: &'static str) -> EvResult<Arc<DomainShared<H>>> {
        self.shared
            .clone()
            .ok_or(EvError::InvalidState { op, state: self.dev })
    }

    /// Forgets hardware ids and keeps settings and links for the next start.
    fn mark_prev_configured(&mut self) {
        for queue in &mut self.queues {
            queue.forget_hw();
        }
        for port in &mut self.ports {
            port.forget_hw();
        }
    }

    fn fresh_records(&mut self, config: &DomainConfig) {
        self.queues = (0..config.nb_event_queues).map(|_| QueueRecord::default()).collect();
        self.ports = (0..config.nb_event_ports).map(|_| PortRecord::default()).collect();
    }
}

/// One event device: the resource manager and link manager behind a lock.
pub struct EventDev<H: HwDevice> {
    pub(crate) hw: Arc<H>,
    name: String,
    pub(crate) args: DevArgs,
    pub(crate) version: DeviceVersion,
    pub(crate) poll_mode: CqPollMode,
    pub(crate) wait_for_write: bool,
    pub(crate) state: Mutex<DomainState<H>>,
}

impl<H: HwDevice> fmt::Debug for EventDev<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDev")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("poll_mode", &self.poll_mode)
            .field("state", &self.state.lock().dev)
            .finish()
    }
}

impl<H: HwDevice> EventDev<H> {
    /// Opens `name` on `hw` and applies the probe-time overrides.
    pub fn probe(hw: Arc<H>, name: &str, args: DevArgs) -> EvResult<Self> {
        hw.open(name).map_err(hw_err)?;
        let version = hw.device_version().map_err(hw_err)?;
        let resources = hw.query_resources().map_err(hw_err)?;
        let poll_mode = hw.poll_mode().map_err(hw_err)?;

        Self::validate_args(&args, version, &resources)?;
        cos::validate_bandwidth(&args.cos_bandwidth)?;
        // Clear every share first so no intermediate state exceeds 100%.
        for class in 0..NUM_COS as u8 {
            hw.set_cos_bandwidth(class, 0).map_err(hw_err)?;
        }
        for (class, pct) in args.cos_bandwidth.iter().enumerate() {
            hw.set_cos_bandwidth(class as u8, *pct).map_err(hw_err)?;
        }

        let wait_for_write = hw.supports_wait_for_write();
        log::debug!(
            "{name}: probed {version:?}, poll mode {poll_mode:?}, wait-for-write {wait_for_write}, {resources:?}"
        );
        Ok(Self {
            hw,
            name: name.to_owned(),
            args,
            version,
            poll_mode,
            wait_for_write,
            state: Mutex::new(DomainState::empty()),
        })
    }

    fn validate_args(
        args: &DevArgs,
        version: DeviceVersion,
        resources: &ResourceCounts,
    ) -> EvResult<()> {
        if let Some(max) = args.max_num_events {
            if max == 0 || max > resources.event_credits(version) {
                return Err(EvError::config(format!(
                    "max_num_events {max} outside 1..={}",
                    resources.event_credits(version)
                )));
            }
        }
        if let Some(dir) = args.num_dir_credits_override {
            if version.combined_credits() {
                log::warn!("directed credit override ignored: device has a combined pool");
            } else if dir > MAX_DIR_CREDITS {
                return Err(EvError::config(format!(
                    "directed credit override {dir} above {MAX_DIR_CREDITS}"
                )));
            }
        }
        for (queue, threshold) in &args.qid_depth_thresholds {
            if *threshold > MAX_DEPTH_THRESHOLD {
                return Err(EvError::config(format!(
                    "depth threshold {threshold} for queue {queue} above {MAX_DEPTH_THRESHOLD}"
                )));
            }
        }
        if args.default_depth_threshold > MAX_DEPTH_THRESHOLD {
            return Err(EvError::config("default depth threshold too large"));
        }
        if args.sw_credit_quanta == 0
            || args.producer_sw_credit_quanta == 0
            || args.consumer_sw_credit_quanta == 0
            || args.hw_credit_quanta == 0
        {
            return Err(EvError::config("credit quanta must be non-zero"));
        }
        if args.hist_list_per_ldb_port == 0 {
            return Err(EvError::config("history list per port must be non-zero"));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> DeviceVersion {
        self.version
    }

    /// The device boundary this event device drives.
    pub fn hw(&self) -> &Arc<H> {
        &self.hw
    }

    pub fn dev_args(&self) -> &DevArgs {
        &self.args
    }

    pub fn state(&self) -> DevState {
        self.state.lock().dev
    }

    pub fn domain_config(&self) -> Option<DomainConfig> {
        self.state.lock().config.clone()
    }

    fn max_events(&self, resources: &ResourceCounts) -> u32 {
        let credits = resources.event_credits(self.version);
        self.args.max_num_events.map_or(credits, |m| m.min(credits))
    }

    /// Device limits, counting resources this domain holds as available.
    pub fn info(&self) -> EvResult<DevInfo> {
        let st = self.state.lock();
        let mut res = self.hw.query_resources().map_err(hw_err)?;
        if let (Some(args), Some(_)) = (&st.hw_args, &st.shared) {
            res.num_ldb_queues += args.num_ldb_queues;
            res.num_ldb_ports += args.total_ldb_ports();
            res.num_dir_ports += args.num_dir_ports;
            res.num_ldb_credits += args.num_ldb_credits;
            res.num_dir_credits += args.num_dir_credits;
            res.num_credits += args.num_credits;
        }
        Ok(DevInfo {
            driver_name: self.name.clone(),
            version: self.version,
            max_event_queues: (res.num_ldb_queues + res.num_dir_ports).min(MAX_EVENT_QUEUES),
            max_event_ports: (res.num_ldb_ports + res.num_dir_ports).min(MAX_EVENT_PORTS),
            max_single_link_event_port_queue_pairs: res.num_dir_ports,
            max_event_queue_flows: MAX_NUM_FLOWS,
            max_event_queue_priority_levels: QID_PRIORITIES,
            max_event_port_dequeue_depth: MAX_CQ_DEPTH,
            max_event_port_enqueue_depth: MAX_ENQUEUE_DEPTH,
            max_event_port_links: MAX_LINKS_PER_LDB_PORT as u32,
            max_num_events: self.max_events(&res),
        })
    }

    /// Creates (or recreates) the scheduling domain.
    ///
    /// Any existing hardware domain is reset first. When the queue and port
    /// counts are unchanged, records already set up become previously
    /// configured and keep their links; otherwise every record starts fresh.
    pub fn configure(&self, config: DomainConfig) -> EvResult<()> {
        let mut st = self.state.lock();
        if st.dev == DevState::Started {
            return Err(EvError::InvalidState {
                op: "configure",
                state: st.dev,
            });
        }
        match self.configure_locked(&mut st, config) {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(shared) = st.shared.take() {
                    self.release_hw(&shared);
                }
                *st = DomainState::empty();
                Err(err)
            }
        }
    }

    fn configure_locked(&self, st: &mut DomainState<H>, config: DomainConfig) -> EvResult<()> {
        let prev = st.config.take();
        if let Some(shared) = st.shared.take() {
            self.release_hw(&shared);
        }

        let res = self.hw.query_resources().map_err(hw_err)?;
        self.validate_domain(&config, &res)?;
        let args = self.domain_args(&config)?;
        let shared = self.create_hw_domain(&args, config.nb_events_limit)?;

        if prev.as_ref().is_some_and(|p| p.same_shape(&config)) {
            st.mark_prev_configured();
        } else {
            st.fresh_records(&config);
        }
        log::debug!(
            "{}: domain {} configured: {} queues ({} directed), {} ports, limit {}",
            self.name,
            shared.domain_id,
            config.nb_event_queues,
            config.nb_single_link_event_port_queues,
            config.nb_event_ports,
            config.nb_events_limit
        );
        st.config = Some(config);
        st.hw_args = Some(args);
        st.shared = Some(shared);
        st.dev = DevState::Configured;
        Ok(())
    }

    fn validate_domain(&self, config: &DomainConfig, res: &ResourceCounts) -> EvResult<()> {
        let dir = config.nb_single_link_event_port_queues;
        if config.nb_event_queues == 0 || config.nb_event_ports == 0 {
            return Err(EvError::config("a domain needs at least one queue and one port"));
        }
        if dir > config.nb_event_queues || dir > config.nb_event_ports {
            return Err(EvError::config(format!(
                "{dir} single-link pairs exceed the queue or port count"
            )));
        }
        let max_queues = (res.num_ldb_queues + res.num_dir_ports).min(MAX_EVENT_QUEUES);
        if config.nb_event_queues > max_queues {
            return Err(EvError::config(format!(
                "nb_event_queues {} exceeds the device's {max_queues}",
                config.nb_event_queues
            )));
        }
        let max_ports = res.num_ldb_ports + res.num_dir_ports;
        if config.nb_event_ports > max_ports {
            return Err(EvError::config(format!(
                "nb_event_ports {} exceeds the device's {max_ports}",
                config.nb_event_ports
            )));
        }
        if config.ldb_queues() > res.num_ldb_queues.min(MAX_LDB_QUEUES) {
            return Err(EvError::config(format!(
                "{} load-balanced queues requested, {} available",
                config.ldb_queues(),
                res.num_ldb_queues
            )));
        }
        if config.ldb_ports() > res.num_ldb_ports || dir > res.num_dir_ports {
            return Err(EvError::config("port mix exceeds the device's port classes"));
        }
        let max_events = self.max_events(res);
        if config.nb_events_limit == 0 || config.nb_events_limit > max_events {
            return Err(EvError::config(format!(
                "nb_events_limit {} outside 1..={max_events}",
                config.nb_events_limit
            )));
        }
        Ok(())
    }

    fn domain_args(&self, config: &DomainConfig) -> EvResult<DomainArgs> {
        let ldb_queues = config.ldb_queues();
        let ldb_ports = config.ldb_ports();
        let dir_ports = config.nb_single_link_event_port_queues;
        let limit = config.nb_events_limit;
        let plan = CosPlan::new(&self.args, ldb_ports, config.nb_event_ports)?;
        log::debug!(
            "{}: {} load-balanced ports, {} without a class",
            self.name(),
            plan.total(),
            plan.generic
        );

        let mut args = DomainArgs {
            num_ldb_queues: ldb_queues,
            num_ldb_ports: plan.generic,
            num_cos_ldb_ports: plan.per_class,
            cos_strict: false,
            num_dir_ports: dir_ports,
            num_atomic_inflights: NUM_ATOMIC_INFLIGHTS_PER_QUEUE * ldb_queues,
            num_hist_list_entries: ldb_ports * self.args.hist_list_per_ldb_port,
            ..DomainArgs::default()
        };
        if self.version.combined_credits() {
            args.num_credits = limit;
        } else {
            if ldb_queues > 0 {
                args.num_ldb_credits = limit;
            }
            if dir_ports > 0 {
                args.num_dir_credits = self.args.num_dir_credits_override.unwrap_or(limit / 2);
            }
        }
        Ok(args)
    }

    fn create_hw_domain(&self, args: &DomainArgs, limit: u32) -> EvResult<Arc<DomainShared<H>>> {
        let domain_id = self.hw.create_domain(args).map_err(hw_err)?;
        let (ldb, dir) = if self.version.combined_credits() {
            (args.num_credits, 0)
        } else {
            (args.num_ldb_credits, args.num_dir_credits)
        };
        Ok(Arc::new(DomainShared {
            hw: Arc::clone(&self.hw),
            domain_id,
            live: AtomicBool::new(true),
            pools: CreditPools::new(self.version, ldb, dir),
            sw: SwCredits::new(limit),
        }))
    }

    /// Invalidates every port handle of `shared` and returns its resources.
    fn release_hw(&self, shared: &DomainShared<H>) {
        shared.live.store(false, Ordering::Release);
        if let Err(err) = self.hw.reset_domain(shared.domain_id) {
            // The domain is gone from our side either way.
            hw_err(err);
        }
        log::debug!("{}: domain {} reset", self.name, shared.domain_id);
    }

    /// Starts scheduling.
    ///
    /// Every port must be set up and every queue set up with at least one
    /// link. Previously configured queues and ports are recreated first, then
    /// every pending link is mapped.
    pub fn start(&self) -> EvResult<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.require_setup("start")?;
        for (i, port) in st.ports.iter().enumerate() {
            if !port.state.has_config() {
                return Err(EvError::config(format!("port {i} is not set up")));
            }
        }
        for (i, queue) in st.queues.iter().enumerate() {
            if !queue.state.has_config() {
                return Err(EvError::config(format!("queue {i} is not set up")));
            }
            if queue.num_links == 0 {
                return Err(EvError::config(format!("queue {i} has no links")));
            }
        }
        let shared = st.live_shared("start")?;

        let limit = shared.sw.new_event_limit();
        for (id, queue) in st.queues.iter_mut().enumerate() {
            if queue.state == ConfigState::PrevConfigured {
                self.create_queue_hw(&shared, id as u8, queue, limit)?;
                queue.state = ConfigState::Configured;
            }
        }
        for (id, port) in st.ports.iter_mut().enumerate() {
            if port.state == ConfigState::PrevConfigured {
                self.create_port_hw(&shared, id as u8, port)?;
                port.state = ConfigState::Configured;
            }
        }
        self.apply_links(st, &shared)?;

        self.hw.start_domain(shared.domain_id).map_err(hw_err)?;
        st.dev = DevState::Started;
        log::debug!("{}: domain {} started", self.name, shared.domain_id);
        Ok(())
    }

    /// Stops scheduling.
    ///
    /// The hardware domain is reset and immediately re-requested with the
    /// same capacity, so pools return to their maxima and ports claimed
    /// before the stop stop working. Queues and ports keep their settings and
    /// links and are recreated on the next start.
    pub fn stop(&self) -> EvResult<()> {
        let mut st = self.state.lock();
        match st.dev {
            DevState::Started => {}
            DevState::Stopped => return Ok(()),
            state => return Err(EvError::InvalidState { op: "stop", state }),
        }
        if let Some(shared) = st.shared.take() {
            self.release_hw(&shared);
        }
        st.mark_prev_configured();

        let (Some(args), Some(limit)) = (st.hw_args, st.config.as_ref().map(|c| c.nb_events_limit))
        else {
            return Err(EvError::InvalidState {
                op: "stop",
                state: st.dev,
            });
        };
        match self.create_hw_domain(&args, limit) {
            Ok(shared) => {
                st.shared = Some(shared);
                st.dev = DevState::Stopped;
                log::debug!("{}: stopped", self.name);
                Ok(())
            }
            Err(err) => {
                *st = DomainState::empty();
                Err(err)
            }
        }
    }

    /// Resets the hardware domain and forgets every queue, port and link.
    pub fn close(&self) {
        let mut st = self.state.lock();
        if let Some(shared) = st.shared.take() {
            self.release_hw(&shared);
        }
        *st = DomainState::empty();
        log::debug!("{}: closed", self.name);
    }

    pub fn credit_snapshot(&self) -> Option<CreditSnapshot> {
        let st = self.state.lock();
        st.shared.as_ref().map(|shared| CreditSnapshot {
            inflights: shared.sw.inflights(),
            new_event_limit: shared.sw.new_event_limit(),
            pools: shared.pools.levels(),
        })
    }

    /// Events waiting in `queue` for a consumer.
    pub fn queue_depth(&self, queue: u8) -> EvResult<u32> {
        let st = self.state.lock();
        let shared = st.live_shared("queue_depth")?;
        let record = st
            .queues
            .get(queue as usize)
            .ok_or_else(|| EvError::config(format!("queue {queue} out of range")))?;
        let Some(hw_id) = record.hw_id else {
            return Ok(0);
        };
        let hw_queue = if record.directed() {
            HwQueue::Dir(hw_id)
        } else {
            HwQueue::Ldb(hw_id)
        };
        self.hw.queue_depth(shared.domain_id, hw_queue).map_err(hw_err)
    }

    pub fn queue_state(&self, queue: u8) -> Option<ConfigState> {
        self.state.lock().queues.get(queue as usize).map(|q| q.state)
    }

    pub fn port_state(&self, port: u8) -> Option<ConfigState> {
        self.state.lock().ports.get(port as usize).map(|p| p.state)
    }

    /// Dequeue timeout every port uses, or `None` when it is given per call.
    pub(crate) fn global_dequeue_timeout(config: &DomainConfig) -> Option<Duration> {
        (!config.per_dequeue_timeout).then_some(config.dequeue_timeout)
    }
}
