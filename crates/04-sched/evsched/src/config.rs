//! Configuration surface consumed from the application layer.
//!
//! Every struct is plain data with a `Default` and `with_*` helpers, and
//! derives serde so hosts can load it from a file.

use crate::consts::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Class of service for load-balanced ports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cos {
    Cos0,
    Cos1,
    Cos2,
    Cos3,
}

impl Cos {
    pub const ALL: [Cos; NUM_COS] = [Cos::Cos0, Cos::Cos1, Cos::Cos2, Cos::Cos3];

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Device-wide overrides supplied when the device is probed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevArgs {
    /// Upper bound on the events limit advertised and accepted at configure.
    pub max_num_events: Option<u32>,
    /// Directed credits to request instead of half the events limit.
    pub num_dir_credits_override: Option<u32>,
    /// Pins every load-balanced port to one class.
    pub cos_id: Option<Cos>,
    /// Per-port class pins, by event port id.
    pub port_cos: Vec<(u8, Cos)>,
    /// Bandwidth share of each class in percent.
    pub cos_bandwidth: [u8; NUM_COS],
    /// Per-queue depth thresholds, by event queue id.
    pub qid_depth_thresholds: Vec<(u8, u32)>,
    pub default_depth_threshold: u32,
    pub sw_credit_quanta: u32,
    pub producer_sw_credit_quanta: u32,
    pub consumer_sw_credit_quanta: u32,
    pub hw_credit_quanta: u32,
    /// History-list entries budgeted per load-balanced port.
    pub hist_list_per_ldb_port: u32,
    /// Sleep between CQ polls when the platform cannot wait for writes.
    pub poll_interval: Option<Duration>,
    /// Classify CQ windows with the packed kernel.
    pub vector_dequeue: bool,
}

impl Default for DevArgs {
    fn default() -> Self {
        Self {
            max_num_events: None,
            num_dir_credits_override: None,
            cos_id: None,
            port_cos: Vec::new(),
            cos_bandwidth: [25; NUM_COS],
            qid_depth_thresholds: Vec::new(),
            default_depth_threshold: DEFAULT_DEPTH_THRESHOLD,
            sw_credit_quanta: DEFAULT_SW_CREDIT_QUANTA,
            producer_sw_credit_quanta: DEFAULT_PRODUCER_SW_CREDIT_QUANTA,
            consumer_sw_credit_quanta: DEFAULT_CONSUMER_SW_CREDIT_QUANTA,
            hw_credit_quanta: DEFAULT_HW_CREDIT_QUANTA,
            hist_list_per_ldb_port: DEFAULT_HIST_LIST_PER_LDB_PORT,
            poll_interval: None,
            vector_dequeue: true,
        }
    }
}

impl DevArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_num_events(mut self, max: u32) -> Self {
        self.max_num_events = Some(max);
        self
    }

    pub fn with_dir_credits(mut self, credits: u32) -> Self {
        self.num_dir_credits_override = Some(credits);
        self
    }

    pub fn with_cos(mut self, cos: Cos) -> Self {
        self.cos_id = Some(cos);
        self
    }

    pub fn with_port_cos(mut self, port: u8, cos: Cos) -> Self {
        self.port_cos.push((port, cos));
        self
    }

    pub fn with_cos_bandwidth(mut self, bandwidth: [u8; NUM_COS]) -> Self {
        self.cos_bandwidth = bandwidth;
        self
    }

    pub fn with_qid_depth_threshold(mut self, queue: u8, threshold: u32) -> Self {
        self.qid_depth_thresholds.push((queue, threshold));
        self
    }

    pub fn with_sw_credit_quanta(mut self, quanta: u32) -> Self {
        self.sw_credit_quanta = quanta;
        self
    }

    pub fn with_hw_credit_quanta(mut self, quanta: u32) -> Self {
        self.hw_credit_quanta = quanta;
        self
    }

    pub fn with_hist_list_per_ldb_port(mut self, entries: u32) -> Self {
        self.hist_list_per_ldb_port = entries;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn with_vector_dequeue(mut self, enabled: bool) -> Self {
        self.vector_dequeue = enabled;
        self
    }

    /// Depth threshold a queue gets when its own configuration leaves it unset.
    pub fn depth_threshold_for(&self, queue: u8) -> u32 {
        self.qid_depth_thresholds
            .iter()
            .rev()
            .find(|(q, _)| *q == queue)
            .map(|(_, t)| *t)
            .unwrap_or(self.default_depth_threshold)
    }

    pub fn cos_for_port(&self, port: u8) -> Option<Cos> {
        self.port_cos
            .iter()
            .rev()
            .find(|(p, _)| *p == port)
            .map(|(_, c)| *c)
            .or(self.cos_id)
    }
}

/// Capacity requested from the device for one scheduling domain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// Total event queues, directed ones included.
    pub nb_event_queues: u32,
    /// Total event ports, directed ones included.
    pub nb_event_ports: u32,
    /// Directed port/queue pairs carved out of the totals above.
    pub nb_single_link_event_port_queues: u32,
    pub nb_events_limit: u32,
    pub dequeue_timeout: Duration,
    /// Use the per-call dequeue timeout instead of `dequeue_timeout`.
    pub per_dequeue_timeout: bool,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            nb_event_queues: 1,
            nb_event_ports: 1,
            nb_single_link_event_port_queues: 0,
            nb_events_limit: 4096,
            dequeue_timeout: Duration::ZERO,
            per_dequeue_timeout: false,
        }
    }
}

impl DomainConfig {
    pub fn new(nb_event_queues: u32, nb_event_ports: u32) -> Self {
        Self {
            nb_event_queues,
            nb_event_ports,
            ..Self::default()
        }
    }

    pub fn with_single_link(mut self, pairs: u32) -> Self {
        self.nb_single_link_event_port_queues = pairs;
        self
    }

    pub fn with_events_limit(mut self, limit: u32) -> Self {
        self.nb_events_limit = limit;
        self
    }

    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    pub fn with_per_dequeue_timeout(mut self, enabled: bool) -> Self {
        self.per_dequeue_timeout = enabled;
        self
    }

    pub(crate) fn ldb_queues(&self) -> u32 {
        self.nb_event_queues - self.nb_single_link_event_port_queues
    }

    pub(crate) fn ldb_ports(&self) -> u32 {
        self.nb_event_ports - self.nb_single_link_event_port_queues
    }

    /// True when both configurations carve the same queue and port counts.
    pub(crate) fn same_shape(&self, other: &DomainConfig) -> bool {
        self.nb_event_queues == other.nb_event_queues
            && self.nb_event_ports == other.nb_event_ports
            && self.nb_single_link_event_port_queues == other.nb_single_link_event_port_queues
    }
}

/// Scheduling discipline of a load-balanced queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueSched {
    #[default]
    Atomic,
    Ordered,
    Unordered,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub schedule_type: QueueSched,
    /// Accept atomic, ordered and unordered events alike.
    pub all_types: bool,
    pub nb_atomic_flows: u32,
    /// Sequence numbers for ordered delivery; zero for none.
    pub nb_atomic_order_sequences: u32,
    pub priority: u8,
    pub depth_threshold: Option<u32>,
    /// Directed queue paired with exactly one port.
    pub single_link: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            schedule_type: QueueSched::Atomic,
            all_types: false,
            nb_atomic_flows: 1024,
            nb_atomic_order_sequences: 0,
            priority: 0,
            depth_threshold: None,
            single_link: false,
        }
    }
}

impl QueueConfig {
    pub fn atomic() -> Self {
        Self::default()
    }

    pub fn ordered(sequences: u32) -> Self {
        Self {
            schedule_type: QueueSched::Ordered,
            nb_atomic_order_sequences: sequences,
            ..Self::default()
        }
    }

    pub fn unordered() -> Self {
        Self {
            schedule_type: QueueSched::Unordered,
            ..Self::default()
        }
    }

    pub fn single_link() -> Self {
        Self {
            single_link: true,
            ..Self::default()
        }
    }

    pub fn with_all_types(mut self, sequences: u32) -> Self {
        self.all_types = true;
        self.nb_atomic_order_sequences = sequences;
        self
    }

    pub fn with_depth_threshold(mut self, threshold: u32) -> Self {
        self.depth_threshold = Some(threshold);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// Traffic pattern hint; producers skip the store fence before device writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortHint {
    #[default]
    None,
    Producer,
    Consumer,
}

/// When consumed CQ slots are handed back to the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenPopMode {
    /// Right after each dequeue.
    #[default]
    Auto,
    /// At the start of the next dequeue.
    Deferred,
    /// Once `threshold` releases have been issued since the last return.
    Delayed { threshold: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub dequeue_depth: u32,
    pub enqueue_depth: u32,
    /// Domain inflight count above which this port stops admitting new events.
    pub new_event_threshold: u32,
    /// Release outstanding events at the start of the next dequeue.
    pub implicit_release: bool,
    pub hint: PortHint,
    pub single_link: bool,
    pub token_pop: TokenPopMode,
    /// Restore dequeue order for forwards/releases issued out of order.
    pub independent_enqueue: bool,
    /// Extra attempts with a pause when credits run out mid-burst.
    pub enqueue_retries: u32,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            dequeue_depth: 32,
            enqueue_depth: 32,
            new_event_threshold: 4096,
            implicit_release: true,
            hint: PortHint::None,
            single_link: false,
            token_pop: TokenPopMode::Auto,
            independent_enqueue: false,
            enqueue_retries: DEFAULT_ENQUEUE_RETRIES,
        }
    }
}

impl PortConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single_link() -> Self {
        Self {
            single_link: true,
            ..Self::default()
        }
    }

    pub fn with_dequeue_depth(mut self, depth: u32) -> Self {
        self.dequeue_depth = depth;
        self
    }

    pub fn with_enqueue_depth(mut self, depth: u32) -> Self {
        self.enqueue_depth = depth;
        self
    }

    pub fn with_new_event_threshold(mut self, threshold: u32) -> Self {
        self.new_event_threshold = threshold;
        self
    }

    pub fn with_implicit_release(mut self, enabled: bool) -> Self {
        self.implicit_release = enabled;
        self
    }

    pub fn with_hint(mut self, hint: PortHint) -> Self {
        self.hint = hint;
        self
    }

    pub fn with_token_pop(mut self, mode: TokenPopMode) -> Self {
        self.token_pop = mode;
        self
    }

    pub fn with_independent_enqueue(mut self, enabled: bool) -> Self {
        self.independent_enqueue = enabled;
        self
    }

    pub fn with_enqueue_retries(mut self, retries: u32) -> Self {
        self.enqueue_retries = retries;
        self
    }
}
