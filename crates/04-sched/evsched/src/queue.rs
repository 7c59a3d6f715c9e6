//! Event queue records and queue setup.

use crate::config::{QueueConfig, QueueSched};
use crate::consts::*;
use crate::domain::{ConfigState, DomainShared, EventDev};
use crate::error::{hw_err, EvError, EvResult, Resource};
use crate::sn;
use hw_iface::{HwDevice, LdbQueueArgs};

/// Queue inflights granted to unordered and atomic queues.
const DEFAULT_QID_INFLIGHTS: u32 = 2048;

#[derive(Clone, Debug, Default)]
pub(crate) struct QueueRecord {
    pub state: ConfigState,
    pub config: QueueConfig,
    /// Discipline after resolving `all_types`.
    pub sched: QueueSched,
    pub depth_threshold: u32,
    pub hw_id: Option<u32>,
    pub num_links: u32,
    /// Directed queues: the event port holding the link.
    pub dir_port: Option<u8>,
    /// Directed queues: the event port the hardware queue was created for.
    pub bound_port: Option<u8>,
}

impl QueueRecord {
    pub fn directed(&self) -> bool {
        self.config.single_link
    }

    /// Drops hardware ids after a domain reset, keeping settings and links.
    pub fn forget_hw(&mut self) {
        if self.state.has_config() {
            self.state = ConfigState::PrevConfigured;
        }
        self.hw_id = None;
        self.bound_port = None;
    }
}

/// Resolves the hardware discipline of a load-balanced queue.
pub(crate) fn resolve_sched(config: &QueueConfig) -> QueueSched {
    if config.all_types {
        if config.nb_atomic_order_sequences > 0 {
            QueueSched::Ordered
        } else {
            QueueSched::Unordered
        }
    } else {
        config.schedule_type
    }
}

fn validate(config: &QueueConfig, sched: QueueSched) -> EvResult<()> {
    if config.nb_atomic_flows == 0 || config.nb_atomic_flows > MAX_NUM_FLOWS {
        return Err(EvError::config(format!(
            "nb_atomic_flows {} outside 1..={MAX_NUM_FLOWS}",
            config.nb_atomic_flows
        )));
    }
    let sequences = config.nb_atomic_order_sequences;
    if sched == QueueSched::Ordered && sequences == 0 {
        return Err(EvError::config("ordered queue needs sequence numbers"));
    }
    if sequences > 0
        && (!sequences.is_power_of_two()
            || !(MIN_SN_ALLOCATION..=SN_GROUP_CAPACITY).contains(&sequences))
    {
        return Err(EvError::config(format!(
            "{sequences} sequence numbers is not a power of two in {MIN_SN_ALLOCATION}..={SN_GROUP_CAPACITY}"
        )));
    }
    if let Some(threshold) = config.depth_threshold {
        if threshold > MAX_DEPTH_THRESHOLD {
            return Err(EvError::config(format!(
                "depth threshold {threshold} above {MAX_DEPTH_THRESHOLD}"
            )));
        }
    }
    Ok(())
}

impl<H: HwDevice> EventDev<H> {
    /// Sets up event queue `queue`.
    ///
    /// Load-balanced queues are created in hardware right away. Directed
    /// queues only reserve one of the domain's single-link slots; the hardware
    /// queue appears when a port links to them.
    pub fn queue_setup(&self, queue: u8, config: QueueConfig) -> EvResult<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.require_setup("queue_setup")?;
        let domain = st.require_config("queue_setup")?.clone();
        if u32::from(queue) >= domain.nb_event_queues {
            return Err(EvError::config(format!(
                "queue {queue} outside 0..{}",
                domain.nb_event_queues
            )));
        }
        if st.queues[queue as usize].state == ConfigState::Configured {
            return Err(EvError::config(format!("queue {queue} is already set up")));
        }

        let others = st
            .queues
            .iter()
            .enumerate()
            .filter(|(i, q)| *i != queue as usize && q.state.has_config());
        if config.single_link {
            let directed = others.filter(|(_, q)| q.directed()).count() as u32;
            if directed >= domain.nb_single_link_event_port_queues {
                return Err(EvError::ResourceExhausted(Resource::DirectedQueueSlots));
            }
        } else {
            let balanced = others.filter(|(_, q)| !q.directed()).count() as u32;
            if balanced >= domain.ldb_queues() {
                return Err(EvError::config(format!(
                    "all {} load-balanced queues are set up",
                    domain.ldb_queues()
                )));
            }
        }

        let sched = resolve_sched(&config);
        if !config.single_link {
            validate(&config, sched)?;
        }
        let depth_threshold = config
            .depth_threshold
            .unwrap_or_else(|| self.args.depth_threshold_for(queue));

        let record = &mut st.queues[queue as usize];
        let was_directed = record.directed() && record.state.has_config();
        if was_directed != config.single_link && record.num_links > 0 {
            return Err(EvError::config(format!(
                "queue {queue} changes direction while linked"
            )));
        }
        let mut next = QueueRecord {
            state: ConfigState::Configured,
            config,
            sched,
            depth_threshold,
            hw_id: None,
            num_links: record.num_links,
            dir_port: record.dir_port,
            bound_port: None,
        };
        if let Some(shared) = st.shared.clone() {
            self.create_queue_hw(&shared, queue, &mut next, domain.nb_events_limit)?;
        }
        log::debug!(
            "{}: queue {queue} set up ({}{:?})",
            self.name(),
            if next.directed() { "directed, " } else { "" },
            next.sched
        );
        st.queues[queue as usize] = next;
        Ok(())
    }

    /// Creates the hardware side of a load-balanced queue; directed queues wait for their link.
    pub(crate) fn create_queue_hw(
        &self,
        shared: &DomainShared<H>,
        queue: u8,
        record: &mut QueueRecord,
        limit: u32,
    ) -> EvResult<()> {
        if record.directed() {
            return Ok(());
        }
        let sequences = if record.sched == QueueSched::Ordered {
            record.config.nb_atomic_order_sequences
        } else {
            0
        };
        if sequences > 0 {
            sn::prepare_group(self.hw.as_ref(), sequences);
        }
        let args = LdbQueueArgs {
            num_sequence_numbers: sequences,
            num_qid_inflights: if sequences > 0 {
                sequences
            } else {
                DEFAULT_QID_INFLIGHTS.min(limit.max(1))
            },
            num_atomic_inflights: NUM_ATOMIC_INFLIGHTS_PER_QUEUE,
            lock_id_comp_level: 0,
            depth_threshold: record.depth_threshold,
        };
        let hw_id = self
            .hw
            .create_ldb_queue(shared.domain_id, &args)
            .map_err(|err| {
                if sequences > 0 {
                    log::error!("queue {queue}: no sequence-number group holds {sequences}");
                }
                hw_err(err)
            })?;
        record.hw_id = Some(hw_id);
        log::trace!("queue {queue} -> ldb qid {hw_id}");
        Ok(())
    }
}
