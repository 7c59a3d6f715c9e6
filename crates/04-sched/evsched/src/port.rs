//! Event port records, port setup and the per-thread port handle.

use crate::config::{PortConfig, PortHint, QueueSched, TokenPopMode};
use crate::consts::*;
use crate::cos;
use crate::credit::{CreditKind, FlushedCredits, PortCredits};
use crate::domain::{ConfigState, DevState, DomainShared, EventDev};
use crate::error::{hw_err, EvError, EvResult};
use crate::link::LinkSlot;
use crate::pause::{PausePolicy, SpinPause};
use crate::reorder::ReorderBuffer;
use hw_iface::{DirPortArgs, HwDevice, HwPort, LdbPortArgs};
use qe_ring::{CqCursor, CqRing};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How a port waits for its CQ when a dequeue finds it empty.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WaitStrategy {
    #[default]
    BusyPoll,
    /// Park on the CQ doorbell until the device writes or the deadline passes.
    WaitForWrite,
    /// Sleep this long between polls.
    Interval(Duration),
}

pub(crate) const NO_QUEUE: u16 = u16::MAX;

/// Port state reachable from both the control path and the port's thread.
#[derive(Debug)]
pub(crate) struct PortShared {
    /// Hardware load-balanced qid to event queue id.
    pub qid_map: [AtomicU8; MAX_LDB_QUEUES as usize],
    /// Directed ports: the single linked event queue.
    pub dir_queue: AtomicU16,
    /// Software credits the port holds locally.
    pub inflight_credits: AtomicU32,
    pub claimed: AtomicBool,
}

impl PortShared {
    pub fn new() -> Self {
        Self {
            qid_map: std::array::from_fn(|_| AtomicU8::new(UNMAPPED_QID)),
            dir_queue: AtomicU16::new(NO_QUEUE),
            inflight_credits: AtomicU32::new(0),
            claimed: AtomicBool::new(false),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct PortRecord {
    pub state: ConfigState,
    pub config: PortConfig,
    pub cq_depth: u32,
    pub hw_id: Option<u32>,
    pub cq: Option<Arc<CqRing>>,
    pub shared: Option<Arc<PortShared>>,
    pub links: [Option<LinkSlot>; MAX_LINKS_PER_LDB_PORT],
    pub wait: WaitStrategy,
}

impl PortRecord {
    pub fn directed(&self) -> bool {
        self.config.single_link
    }

    pub fn num_links(&self) -> usize {
        self.links.iter().flatten().count()
    }

    pub fn hw_port(&self) -> Option<HwPort> {
        self.hw_id.map(|id| {
            if self.directed() {
                HwPort::Dir(id)
            } else {
                HwPort::Ldb(id)
            }
        })
    }

    /// Frees the CQ and hardware ids after a domain reset, keeping settings and links.
    pub fn forget_hw(&mut self) {
        if self.state.has_config() {
            self.state = ConfigState::PrevConfigured;
        }
        self.hw_id = None;
        self.cq = None;
        self.shared = None;
        for slot in self.links.iter_mut().flatten() {
            slot.mapped = false;
        }
    }
}

/// CQ depth for a requested dequeue depth.
pub(crate) fn cq_depth_for(dequeue_depth: u32) -> EvResult<u32> {
    if dequeue_depth == 0 || dequeue_depth > MAX_CQ_DEPTH {
        return Err(EvError::config(format!(
            "dequeue depth {dequeue_depth} outside 1..={MAX_CQ_DEPTH}"
        )));
    }
    Ok(dequeue_depth.next_power_of_two().max(MIN_CQ_DEPTH))
}

fn validate(config: &PortConfig, cq_depth: u32, limit: u32) -> EvResult<()> {
    if config.enqueue_depth == 0 || config.enqueue_depth > MAX_ENQUEUE_DEPTH {
        return Err(EvError::config(format!(
            "enqueue depth {} outside 1..={MAX_ENQUEUE_DEPTH}",
            config.enqueue_depth
        )));
    }
    if config.new_event_threshold == 0 || config.new_event_threshold > limit {
        return Err(EvError::config(format!(
            "new event threshold {} outside 1..={limit}",
            config.new_event_threshold
        )));
    }
    if config.single_link && config.independent_enqueue {
        return Err(EvError::config(
            "independent enqueue needs a load-balanced port",
        ));
    }
    if let TokenPopMode::Delayed { threshold } = config.token_pop {
        if threshold == 0 || threshold > cq_depth {
            return Err(EvError::config(format!(
                "delayed token pop threshold {threshold} outside 1..={cq_depth}"
            )));
        }
    }
    Ok(())
}

impl<H: HwDevice> EventDev<H> {
    fn wait_strategy(&self) -> WaitStrategy {
        if self.wait_for_write {
            WaitStrategy::WaitForWrite
        } else if let Some(interval) = self.args.poll_interval {
            WaitStrategy::Interval(interval)
        } else {
            WaitStrategy::BusyPoll
        }
    }

    /// Sets up event port `port`, allocating its CQ and creating it in hardware.
    pub fn port_setup(&self, port: u8, config: PortConfig) -> EvResult<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.require_setup("port_setup")?;
        let domain = st.require_config("port_setup")?.clone();
        if u32::from(port) >= domain.nb_event_ports {
            return Err(EvError::config(format!(
                "port {port} outside 0..{}",
                domain.nb_event_ports
            )));
        }
        if st.ports[port as usize].state == ConfigState::Configured {
            return Err(EvError::config(format!("port {port} is already set up")));
        }
        let cq_depth = cq_depth_for(config.dequeue_depth)?;
        validate(&config, cq_depth, domain.nb_events_limit)?;

        let others = st
            .ports
            .iter()
            .enumerate()
            .filter(|(i, p)| *i != port as usize && p.state.has_config());
        if config.single_link {
            let directed = others.filter(|(_, p)| p.directed()).count() as u32;
            if directed >= domain.nb_single_link_event_port_queues {
                return Err(EvError::config(format!(
                    "all {} single-link ports are set up",
                    domain.nb_single_link_event_port_queues
                )));
            }
        } else {
            let balanced = others.filter(|(_, p)| !p.directed()).count() as u32;
            if balanced >= domain.ldb_ports() {
                return Err(EvError::config(format!(
                    "all {} load-balanced ports are set up",
                    domain.ldb_ports()
                )));
            }
        }

        let record = &mut st.ports[port as usize];
        if record.directed() != config.single_link && record.num_links() > 0 {
            return Err(EvError::config(format!(
                "port {port} changes direction while linked"
            )));
        }
        let mut next = PortRecord {
            state: ConfigState::Configured,
            config,
            cq_depth,
            hw_id: None,
            cq: None,
            shared: None,
            links: record.links,
            wait: self.wait_strategy(),
        };
        if let Some(shared) = st.shared.clone() {
            self.create_port_hw(&shared, port, &mut next)?;
        }
        log::debug!(
            "{}: port {port} set up ({}cq depth {cq_depth}, {:?})",
            self.name(),
            if next.directed() { "directed, " } else { "" },
            next.wait
        );
        st.ports[port as usize] = next;
        Ok(())
    }

    /// Allocates the CQ and creates the hardware port. The ring is freed with
    /// the record on every path.
    pub(crate) fn create_port_hw(
        &self,
        shared: &DomainShared<H>,
        port: u8,
        record: &mut PortRecord,
    ) -> EvResult<()> {
        let cq = Arc::new(CqRing::new(record.cq_depth, self.poll_mode)?);
        let hw_id = if record.directed() {
            self.hw.create_dir_port(
                shared.domain_id,
                DirPortArgs {
                    cq: Arc::clone(&cq),
                    queue_id: None,
                },
            )
        } else {
            self.hw.create_ldb_port(
                shared.domain_id,
                LdbPortArgs {
                    cq: Arc::clone(&cq),
                    cq_history_list_size: record.cq_depth.min(self.args.hist_list_per_ldb_port),
                    cos_id: cos::port_class(&self.args, port),
                },
            )
        }
        .map_err(hw_err)?;
        record.hw_id = Some(hw_id);
        record.cq = Some(cq);
        record.shared = Some(Arc::new(PortShared::new()));
        log::trace!("port {port} -> {:?}", record.hw_port());
        Ok(())
    }

    /// Claims the data-path handle of `port` for the calling thread.
    ///
    /// Only one handle per port exists at a time; dropping it hands the
    /// port's cached credits back and frees the claim.
    pub fn port(&self, port: u8) -> EvResult<EventPort<H>> {
        let st = self.state.lock();
        if st.dev != DevState::Started {
            return Err(EvError::InvalidState {
                op: "port",
                state: st.dev,
            });
        }
        let domain = st.live_shared("port")?;
        let config = st.require_config("port")?.clone();
        let record = st
            .ports
            .get(port as usize)
            .ok_or_else(|| EvError::config(format!("port {port} out of range")))?;
        let (Some(hw_port), Some(cq), Some(shared)) =
            (record.hw_port(), record.cq.clone(), record.shared.clone())
        else {
            return Err(EvError::config(format!("port {port} is not set up")));
        };
        if shared.claimed.swap(true, Ordering::AcqRel) {
            return Err(EvError::CallerMisuse("port already claimed"));
        }

        let routes = st.queues.iter().map(|q| {
            q.hw_id.map(|hw_id| QueueRoute {
                hw_qid: hw_id as u8,
                directed: q.directed(),
                sched: q.sched,
                all_types: q.config.all_types,
            })
        });
        let pc = &record.config;
        let sw_quanta = match pc.hint {
            PortHint::Producer => self.args.producer_sw_credit_quanta,
            PortHint::Consumer => self.args.consumer_sw_credit_quanta,
            PortHint::None => self.args.sw_credit_quanta,
        };
        let reorder = (pc.independent_enqueue && !record.directed())
            .then(|| ReorderBuffer::new(record.cq_depth));
        Ok(EventPort {
            id: port,
            hw_port,
            directed: record.directed(),
            cursor: CqCursor::new(cq.depth()),
            cq,
            domain,
            shared,
            routes: routes.collect(),
            credits: PortCredits::new(
                self.args.hw_credit_quanta,
                sw_quanta,
                pc.new_event_threshold,
            ),
            config: pc.clone(),
            dequeue_timeout: Self::global_dequeue_timeout(&config),
            wait: record.wait,
            vector_dequeue: self.args.vector_dequeue,
            reorder,
            outstanding: 0,
            owed_tokens: 0,
            issued_completions: 0,
            zero_dequeues: 0,
            enqueue_failures: 0,
            pause: Box::new(SpinPause::default()),
        })
    }
}

/// Where events sent to one event queue go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct QueueRoute {
    pub hw_qid: u8,
    pub directed: bool,
    pub sched: QueueSched,
    pub all_types: bool,
}

/// Data-path handle of one port, used by exactly one thread.
///
/// Enqueue and dequeue take no locks; they coordinate with other ports only
/// through the domain's credit counters.
pub struct EventPort<H: HwDevice> {
    pub(crate) id: u8,
    pub(crate) hw_port: HwPort,
    pub(crate) directed: bool,
    pub(crate) cq: Arc<CqRing>,
    pub(crate) cursor: CqCursor,
    pub(crate) domain: Arc<DomainShared<H>>,
    pub(crate) shared: Arc<PortShared>,
    /// Indexed by event queue id; snapshot taken when the port was claimed.
    /// Start binds every linked queue and stop invalidates the handle, so it
    /// stays complete for the handle's lifetime.
    pub(crate) routes: Vec<Option<QueueRoute>>,
    pub(crate) credits: PortCredits,
    pub(crate) config: PortConfig,
    pub(crate) dequeue_timeout: Option<Duration>,
    pub(crate) wait: WaitStrategy,
    pub(crate) vector_dequeue: bool,
    pub(crate) reorder: Option<ReorderBuffer>,
    /// Dequeued events not yet forwarded or released.
    pub(crate) outstanding: u32,
    /// CQ slots consumed but not yet handed back.
    pub(crate) owed_tokens: u32,
    pub(crate) issued_completions: u32,
    pub(crate) zero_dequeues: u32,
    pub(crate) enqueue_failures: u32,
    pub(crate) pause: Box<dyn PausePolicy>,
}

impl<H: HwDevice> std::fmt::Debug for EventPort<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPort")
            .field("id", &self.id)
            .field("hw_port", &self.hw_port)
            .field("outstanding", &self.outstanding)
            .field("owed_tokens", &self.owed_tokens)
            .field("credits", &self.credits)
            .finish()
    }
}

impl<H: HwDevice> EventPort<H> {
    /// Replaces the pause used between enqueue retries.
    pub fn with_pause(mut self, pause: Box<dyn PausePolicy>) -> Self {
        self.pause = pause;
        self
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn hw_port(&self) -> HwPort {
        self.hw_port
    }

    pub fn is_directed(&self) -> bool {
        self.directed
    }

    /// Dequeued events still waiting for a forward or release.
    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    /// Hardware credits cached by this port, all classes together.
    pub fn cached_hw_credits(&self) -> u32 {
        self.credits.cached_hw()
    }

    pub fn cached_credits(&self, kind: CreditKind) -> u32 {
        self.credits.cached(kind)
    }

    /// Software credits held locally by this port.
    pub fn cached_sw_credits(&self) -> u32 {
        self.shared.inflight_credits.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_live(&self, op: &'static str) -> EvResult<()> {
        if self.domain.is_live() {
            Ok(())
        } else {
            Err(EvError::InvalidState {
                op,
                state: DevState::Stopped,
            })
        }
    }

    /// Hands every cached software and hardware credit back to the domain.
    pub fn flush_credits(&mut self) -> EvResult<FlushedCredits> {
        self.ensure_live("flush_credits")?;
        let flushed = self.credits.flush(
            &self.domain.pools,
            &self.domain.sw,
            &self.shared.inflight_credits,
        );
        log::trace!(
            "port {} returned {} software and {} hardware credits",
            self.id,
            flushed.software,
            flushed.hardware
        );
        Ok(flushed)
    }
}

impl<H: HwDevice> Drop for EventPort<H> {
    fn drop(&mut self) {
        if self.domain.is_live() {
            let _ = self.flush_credits();
        }
        self.shared.claimed.store(false, Ordering::Release);
    }
}
