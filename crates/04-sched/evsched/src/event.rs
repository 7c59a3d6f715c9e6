//! Caller-visible events and their mapping onto queue entries.

use crate::consts::PRIORITY_SHIFT;
use qe_ring::{HwSchedType, Qe};
use serde::{Deserialize, Serialize};

/// What an enqueued event asks the device to do.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventOp {
    /// Admit a new event; costs a software and a hardware credit.
    #[default]
    New,
    /// Pass a dequeued event on to another queue.
    Forward,
    /// Retire a dequeued event.
    Release,
}

/// Scheduling discipline requested by the producer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedType {
    #[default]
    Atomic,
    Ordered,
    Unordered,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub op: EventOp,
    pub sched: SchedType,
    pub queue_id: u8,
    /// Flow key; atomic queues never run two events of one flow concurrently.
    pub flow_id: u16,
    /// 0 is the highest priority.
    pub priority: u8,
    pub payload: u64,
    /// Reorder index assigned at dequeue; echo it back on forward/release.
    pub sequence: u16,
}

impl Event {
    pub fn new(queue_id: u8, sched: SchedType, flow_id: u16, payload: u64) -> Self {
        Self {
            op: EventOp::New,
            sched,
            queue_id,
            flow_id,
            payload,
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// The same event turned into a forward to `queue_id`.
    pub fn forward_to(mut self, queue_id: u8, sched: SchedType) -> Self {
        self.op = EventOp::Forward;
        self.queue_id = queue_id;
        self.sched = sched;
        self
    }

    pub fn into_release(mut self) -> Self {
        self.op = EventOp::Release;
        self
    }

    /// Decodes a CQ entry; `queue_id` comes from the port's lookup table.
    pub(crate) fn from_qe(qe: &Qe, queue_id: u8, sequence: u16) -> Self {
        let sched = match qe.sched {
            HwSchedType::Ordered => SchedType::Ordered,
            HwSchedType::Unordered => SchedType::Unordered,
            HwSchedType::Atomic | HwSchedType::Directed => SchedType::Atomic,
        };
        Self {
            op: EventOp::Forward,
            sched,
            queue_id,
            flow_id: qe.lock_id,
            priority: qe.priority << PRIORITY_SHIFT,
            payload: qe.payload,
            sequence,
        }
    }

    pub(crate) fn hw_priority(&self) -> u8 {
        self.priority >> PRIORITY_SHIFT
    }
}
