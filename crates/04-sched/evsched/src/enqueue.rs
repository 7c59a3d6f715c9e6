//! Enqueue pipeline.
//!
//! Each event becomes one QE. QEs collect in batches of [`QE_BATCH`] and go to
//! the device in a single bulk write, preceded by a store fence unless the
//! port is a pure producer. On credit exhaustion the pipeline retries with the
//! port's pause policy and then returns a short count.

use crate::config::{PortHint, QueueSched, TokenPopMode};
use crate::consts::{ENQUEUE_FAIL_CREDIT_RETURN_THRES, QE_BATCH};
use crate::credit::CreditKind;
use crate::error::{hw_err, EvError, EvResult, Resource};
use crate::event::{Event, EventOp, SchedType};
use crate::port::{EventPort, QueueRoute};
use crate::reorder::SlotError;
use hw_iface::HwDevice;
use qe_ring::{cmd, device_write_fence, HwSchedType, Qe};
use smallvec::SmallVec;

/// Why a data-path call accepted fewer events than offered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The domain's software event limit (or the port's threshold) was reached.
    NoSpace,
    /// No hardware credit of this kind was available.
    NoCredits(CreditKind),
    /// The event itself was rejected.
    InvalidArgument(&'static str),
}

impl StopReason {
    fn retryable(self) -> bool {
        !matches!(self, StopReason::InvalidArgument(_))
    }
}

/// Outcome of an enqueue burst.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Burst {
    /// Events accepted, a prefix of the burst.
    pub count: usize,
    /// Set when `count` is short.
    pub stop: Option<StopReason>,
}

impl Burst {
    pub fn is_complete(&self) -> bool {
        self.stop.is_none()
    }
}

pub(crate) type QeBatch = SmallVec<[Qe; QE_BATCH]>;

enum Halt {
    Stop(StopReason),
    Fatal(EvError),
}

impl From<EvError> for Halt {
    fn from(err: EvError) -> Self {
        match err {
            EvError::ResourceExhausted(Resource::SoftwareCredits) => Halt::Stop(StopReason::NoSpace),
            EvError::ResourceExhausted(Resource::HardwareCredits(kind)) => {
                Halt::Stop(StopReason::NoCredits(kind))
            }
            other => Halt::Fatal(other),
        }
    }
}

/// What a prepared event turned into.
enum Prepared {
    Write(Qe),
    /// Parked in the reorder buffer.
    Parked,
}

/// Maps the requested discipline onto the queue's configured one.
fn hw_sched(route: &QueueRoute, sched: SchedType) -> Result<HwSchedType, StopReason> {
    if route.directed {
        return Ok(HwSchedType::Directed);
    }
    match sched {
        SchedType::Atomic if route.sched == QueueSched::Atomic || route.all_types => {
            Ok(HwSchedType::Atomic)
        }
        SchedType::Ordered if route.sched == QueueSched::Ordered => Ok(HwSchedType::Ordered),
        SchedType::Unordered if route.sched == QueueSched::Ordered => Ok(HwSchedType::Ordered),
        SchedType::Unordered => Ok(HwSchedType::Unordered),
        _ => Err(StopReason::InvalidArgument(
            "scheduling type not accepted by queue",
        )),
    }
}

impl<H: HwDevice> EventPort<H> {
    /// Enqueues `events`, each according to its own op.
    pub fn enqueue_burst(&mut self, events: &[Event]) -> EvResult<Burst> {
        self.enqueue_with(events, None)
    }

    /// Enqueues `events` as new events regardless of their op.
    pub fn enqueue_new_burst(&mut self, events: &[Event]) -> EvResult<Burst> {
        self.enqueue_with(events, Some(EventOp::New))
    }

    /// Enqueues `events` as forwards regardless of their op.
    pub fn enqueue_forward_burst(&mut self, events: &[Event]) -> EvResult<Burst> {
        self.enqueue_with(events, Some(EventOp::Forward))
    }

    fn enqueue_with(&mut self, events: &[Event], forced: Option<EventOp>) -> EvResult<Burst> {
        self.ensure_live("enqueue")?;
        let limit = events.len().min(self.config.enqueue_depth as usize);
        let mut batch = QeBatch::new();
        let mut burst = Burst::default();

        'events: for ev in &events[..limit] {
            let op = forced.unwrap_or(ev.op);
            let mut attempts = 0;
            loop {
                match self.prepare(ev, op) {
                    Ok(Prepared::Write(qe)) => {
                        self.push(&mut batch, qe)?;
                        break;
                    }
                    Ok(Prepared::Parked) => {
                        self.drain_reorder(&mut batch)?;
                        break;
                    }
                    Err(Halt::Stop(reason)) if reason.retryable() && attempts < self.config.enqueue_retries => {
                        attempts += 1;
                        // Hand what is ready to the device before backing off.
                        self.write_batch(&mut batch)?;
                        self.pause.pause();
                    }
                    Err(Halt::Stop(reason)) => {
                        burst.stop = Some(reason);
                        break 'events;
                    }
                    Err(Halt::Fatal(err)) => {
                        self.write_batch(&mut batch)?;
                        return Err(err);
                    }
                }
            }
            if op != EventOp::New {
                self.pop_delayed_tokens(&mut batch)?;
            }
            burst.count += 1;
        }
        self.write_batch(&mut batch)?;

        if burst.stop.is_some() {
            self.enqueue_failures += 1;
            if self.enqueue_failures >= ENQUEUE_FAIL_CREDIT_RETURN_THRES {
                log::trace!("port {}: enqueue keeps failing, returning credits", self.id);
                self.enqueue_failures = 0;
                self.flush_credits()?;
            }
        } else {
            self.enqueue_failures = 0;
            if limit < events.len() {
                burst.stop = Some(StopReason::InvalidArgument("burst exceeds enqueue depth"));
            }
        }
        Ok(burst)
    }

    fn route(&self, ev: &Event) -> Result<(QueueRoute, HwSchedType), Halt> {
        let route = self
            .routes
            .get(ev.queue_id as usize)
            .copied()
            .flatten()
            .ok_or(Halt::Stop(StopReason::InvalidArgument("queue not configured")))?;
        let sched = hw_sched(&route, ev.sched).map_err(Halt::Stop)?;
        Ok((route, sched))
    }

    fn check_reorder_slot(&self, seq: u16) -> Result<(), Halt> {
        match self.reorder.as_ref().map(|r| r.check(seq)) {
            None | Some(Ok(())) => Ok(()),
            Some(Err(SlotError::OutOfWindow)) => Err(Halt::Stop(StopReason::InvalidArgument(
                "sequence was not handed out by dequeue",
            ))),
            Some(Err(SlotError::Occupied)) => Err(Halt::Fatal(EvError::CallerMisuse(
                "sequence already forwarded or released",
            ))),
        }
    }

    fn prepare(&mut self, ev: &Event, op: EventOp) -> Result<Prepared, Halt> {
        match op {
            EventOp::New => {
                let (route, sched) = self.route(ev)?;
                let pool = self.domain.pools.for_queue(route.directed);
                self.credits
                    .ensure_sw(&self.domain.sw, &self.shared.inflight_credits)?;
                self.credits.ensure_hw(pool)?;
                self.credits
                    .consume_sw(&self.shared.inflight_credits)?;
                self.credits.consume_hw(pool.kind());
                Ok(Prepared::Write(self.qe(ev, &route, sched, cmd::NEW, 0)))
            }
            EventOp::Forward => {
                if self.outstanding == 0 {
                    return Err(Halt::Fatal(EvError::CallerMisuse(
                        "forward without an outstanding dequeued event",
                    )));
                }
                let (route, sched) = self.route(ev)?;
                self.check_reorder_slot(ev.sequence)?;
                let pool = self.domain.pools.for_queue(route.directed);
                self.credits.ensure_hw(pool)?;
                self.credits.consume_hw(pool.kind());
                self.outstanding -= 1;
                let qe = self.qe(ev, &route, sched, cmd::FWD, ev.sequence);
                self.park_or_write(ev.sequence, qe)
            }
            EventOp::Release => {
                if self.outstanding == 0 {
                    return Err(Halt::Fatal(EvError::CallerMisuse(
                        "release without an outstanding dequeued event",
                    )));
                }
                self.check_reorder_slot(ev.sequence)?;
                self.outstanding -= 1;
                self.credits
                    .return_sw(&self.domain.sw, &self.shared.inflight_credits);
                let qe = release_qe(ev.payload, ev.sequence);
                self.park_or_write(ev.sequence, qe)
            }
        }
    }

    fn park_or_write(&mut self, seq: u16, qe: Qe) -> Result<Prepared, Halt> {
        match self.reorder.as_mut() {
            Some(buf) => match buf.store(seq, qe) {
                Ok(()) => Ok(Prepared::Parked),
                Err(_) => Err(Halt::Fatal(EvError::CallerMisuse("reorder slot rejected"))),
            },
            None => Ok(Prepared::Write(qe)),
        }
    }

    fn qe(&self, ev: &Event, route: &QueueRoute, sched: HwSchedType, command: u8, opaque: u16) -> Qe {
        Qe {
            payload: ev.payload,
            opaque,
            qid: route.hw_qid,
            sched,
            priority: ev.hw_priority(),
            lock_id: ev.flow_id,
            status: 0,
            cmd: command,
        }
    }

    /// Counts an issued forward or release and, in delayed mode, hands back
    /// CQ tokens once enough of them have gone out.
    fn pop_delayed_tokens(&mut self, batch: &mut QeBatch) -> EvResult<()> {
        self.issued_completions += 1;
        if let TokenPopMode::Delayed { threshold } = self.config.token_pop {
            if self.issued_completions >= threshold && self.owed_tokens > 0 {
                self.issued_completions = 0;
                self.return_tokens(batch)?;
            }
        }
        Ok(())
    }

    /// Queues one token-return command for every owed CQ slot.
    pub(crate) fn return_tokens(&mut self, batch: &mut QeBatch) -> EvResult<()> {
        if self.owed_tokens == 0 {
            return Ok(());
        }
        let owed = self.owed_tokens as u16;
        self.owed_tokens = 0;
        self.push(batch, Qe::token_return(owed))
    }

    /// Moves every ready reorder slot, oldest first, into `batch`.
    pub(crate) fn drain_reorder(&mut self, batch: &mut QeBatch) -> EvResult<()> {
        let mut drained = 0;
        while let Some(qe) = self.reorder.as_mut().and_then(|r| r.pop_ready()) {
            self.push(batch, qe)?;
            drained += 1;
        }
        if drained > 0 {
            log::trace!("port {}: {drained} reordered commands issued", self.id);
        }
        Ok(())
    }

    pub(crate) fn push(&mut self, batch: &mut QeBatch, qe: Qe) -> EvResult<()> {
        batch.push(qe);
        if batch.len() == QE_BATCH {
            self.write_batch(batch)?;
        }
        Ok(())
    }

    /// One bulk write of the pending batch.
    pub(crate) fn write_batch(&mut self, batch: &mut QeBatch) -> EvResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if self.config.hint != PortHint::Producer {
            device_write_fence();
        }
        self.domain
            .hw
            .enqueue(self.hw_port, batch)
            .map_err(hw_err)?;
        batch.clear();
        Ok(())
    }
}

pub(crate) fn release_qe(payload: u64, seq: u16) -> Qe {
    Qe {
        payload,
        opaque: seq,
        cmd: cmd::COMP,
        ..Qe::default()
    }
}
