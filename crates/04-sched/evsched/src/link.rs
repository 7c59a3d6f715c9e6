//! Port-to-queue links.
//!
//! A load-balanced port holds up to eight links, each pending or mapped. Links
//! made while the domain is not running stay pending and are mapped on start;
//! links made while it runs are mapped at once. A directed port and a directed
//! queue pair exactly once.

use crate::consts::PRIORITY_SHIFT;
use crate::domain::{DevState, DomainShared, DomainState, EventDev};
use crate::error::{hw_err, EvError, EvResult, Resource};
use crate::port::{PortRecord, NO_QUEUE};
use crate::queue::QueueRecord;
use hw_iface::{DirQueueArgs, HwDevice, HwStatus};
use std::sync::atomic::Ordering;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LinkSlot {
    pub queue: u8,
    /// Event priority, 0..=255; the device keeps the top three bits.
    pub priority: u8,
    pub mapped: bool,
}

impl<H: HwDevice> EventDev<H> {
    /// Links `port` to each `(queue, priority)` in order.
    ///
    /// Returns the number of entries processed. Processing stops at the first
    /// failing entry, reported as [`EvError::LinkFailed`] with its index.
    pub fn port_link(&self, port: u8, links: &[(u8, u8)]) -> EvResult<usize> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.require_config("port_link")?;
        for (index, &(queue, priority)) in links.iter().enumerate() {
            if let Err(source) = self.link_one(st, port, queue, priority) {
                log::debug!("port {port}: link {index} to queue {queue} failed: {source}");
                return Err(EvError::LinkFailed {
                    index,
                    linked: index,
                    source: Box::new(source),
                });
            }
        }
        Ok(links.len())
    }

    fn link_one(&self, st: &mut DomainState<H>, port: u8, queue: u8, priority: u8) -> EvResult<()> {
        let started = st.dev == DevState::Started;
        let shared = st.shared.clone();
        let DomainState { ports, queues, .. } = st;
        let p = ports
            .get_mut(port as usize)
            .filter(|p| p.state.has_config())
            .ok_or_else(|| EvError::config(format!("port {port} is not set up")))?;
        let q = queues
            .get_mut(queue as usize)
            .filter(|q| q.state.has_config())
            .ok_or_else(|| EvError::config(format!("queue {queue} is not set up")))?;
        if p.directed() != q.directed() {
            return Err(EvError::config(format!(
                "port {port} and queue {queue} differ in direction"
            )));
        }
        if p.directed() {
            return self.link_directed(shared.as_deref(), port, p, queue, q, priority);
        }

        if let Some(slot) = p.links.iter_mut().flatten().find(|s| s.queue == queue) {
            if slot.priority == priority && slot.mapped {
                return Ok(());
            }
            slot.priority = priority;
            slot.mapped = false;
            if started {
                if let Some(shared) = &shared {
                    map(shared, p, port, queue, q)?;
                }
            }
            return Ok(());
        }

        let Some(free) = p.links.iter().position(Option::is_none) else {
            return Err(EvError::ResourceExhausted(Resource::LinkSlots));
        };
        p.links[free] = Some(LinkSlot {
            queue,
            priority,
            mapped: false,
        });
        if started {
            if let Some(shared) = &shared {
                if let Err(err) = map(shared, p, port, queue, q) {
                    p.links[free] = None;
                    return Err(err);
                }
            }
        }
        q.num_links += 1;
        log::trace!("port {port} -> queue {queue} at priority {priority}");
        Ok(())
    }

    fn link_directed(
        &self,
        shared: Option<&DomainShared<H>>,
        port: u8,
        p: &mut PortRecord,
        queue: u8,
        q: &mut QueueRecord,
        priority: u8,
    ) -> EvResult<()> {
        match p.links[0] {
            Some(slot) if slot.queue == queue => return Ok(()),
            Some(slot) => {
                return Err(EvError::config(format!(
                    "directed port {port} is already linked to queue {}",
                    slot.queue
                )))
            }
            None => {}
        }
        if let Some(other) = q.dir_port {
            return Err(EvError::config(format!(
                "directed queue {queue} is already linked to port {other}"
            )));
        }
        if q.bound_port.is_some_and(|b| b != port) {
            return Err(EvError::config(format!(
                "directed queue {queue} stays bound to its first port until reconfigured"
            )));
        }
        p.links[0] = Some(LinkSlot {
            queue,
            priority,
            mapped: false,
        });
        q.dir_port = Some(port);
        q.num_links = 1;
        if let Some(shared) = shared {
            if let Err(err) = bind_directed(self.hw.as_ref(), shared, p, port, queue, q) {
                p.links[0] = None;
                q.dir_port = None;
                q.num_links = 0;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Removes the links from `port` to each of `queues`.
    ///
    /// Queues that are not linked count as processed and change nothing. On a
    /// running domain the hardware mapping is removed first; a device that
    /// reports the pair as not mapped is not an error. Afterwards the port's
    /// locally held software credits go back to the domain.
    pub fn port_unlink(&self, port: u8, queues: &[u8]) -> EvResult<usize> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.require_config("port_unlink")?;
        let started = st.dev == DevState::Started;
        let shared = st.shared.clone();
        let DomainState {
            ports,
            queues: records,
            ..
        } = st;
        let p = ports
            .get_mut(port as usize)
            .filter(|p| p.state.has_config())
            .ok_or_else(|| EvError::config(format!("port {port} is not set up")))?;

        for &queue in queues {
            let Some(idx) = p.links.iter().position(|s| s.is_some_and(|s| s.queue == queue)) else {
                continue;
            };
            let Some(slot) = p.links[idx] else {
                continue;
            };
            let Some(q) = records.get_mut(queue as usize) else {
                continue;
            };
            if p.directed() {
                q.dir_port = None;
                if let Some(port_shared) = &p.shared {
                    port_shared.dir_queue.store(NO_QUEUE, Ordering::Release);
                }
            } else if slot.mapped && started {
                if let (Some(shared), Some(port_hw), Some(qid)) = (&shared, p.hw_id, q.hw_id) {
                    match self.hw.unmap_qid(shared.domain_id, port_hw, qid) {
                        Ok(()) => {}
                        Err(err) if err.status == HwStatus::QidNotMapped => {
                            log::trace!("port {port}: queue {queue} was not mapped");
                        }
                        Err(err) => return Err(hw_err(err)),
                    }
                }
            }
            p.links[idx] = None;
            q.num_links = q.num_links.saturating_sub(1);
            log::trace!("port {port} unlinked from queue {queue}");
        }

        if let (Some(shared), Some(port_shared)) = (&shared, &p.shared) {
            let held = port_shared.inflight_credits.swap(0, Ordering::AcqRel);
            if held > 0 {
                shared.sw.release(held);
                log::trace!("port {port}: {held} software credits returned on unlink");
            }
        }
        Ok(queues.len())
    }

    /// `(queue, priority)` of every link of `port`, in slot order.
    pub fn port_links(&self, port: u8) -> EvResult<Vec<(u8, u8)>> {
        let st = self.state.lock();
        let p = st
            .ports
            .get(port as usize)
            .ok_or_else(|| EvError::config(format!("port {port} out of range")))?;
        Ok(p.links.iter().flatten().map(|s| (s.queue, s.priority)).collect())
    }

    /// Number of ports linked to `queue`.
    pub fn queue_links(&self, queue: u8) -> Option<u32> {
        self.state.lock().queues.get(queue as usize).map(|q| q.num_links)
    }

    /// Maps every pending link; called on start once all records exist in hardware.
    pub(crate) fn apply_links(&self, st: &mut DomainState<H>, shared: &DomainShared<H>) -> EvResult<()> {
        let DomainState { ports, queues, .. } = st;
        for (id, p) in ports.iter_mut().enumerate() {
            let port = id as u8;
            for idx in 0..p.links.len() {
                let Some(slot) = p.links[idx] else {
                    continue;
                };
                let Some(q) = queues.get_mut(slot.queue as usize) else {
                    continue;
                };
                if p.directed() {
                    bind_directed(self.hw.as_ref(), shared, p, port, slot.queue, q)?;
                } else if !slot.mapped {
                    map(shared, p, port, slot.queue, q)?;
                }
            }
        }
        log::debug!("{}: links applied", self.name());
        Ok(())
    }
}

/// Maps a load-balanced link in hardware and records the qid in the port's table.
fn map<H: HwDevice>(
    shared: &DomainShared<H>,
    p: &mut PortRecord,
    port: u8,
    queue: u8,
    q: &QueueRecord,
) -> EvResult<()> {
    let (Some(port_hw), Some(qid), Some(port_shared)) = (p.hw_id, q.hw_id, p.shared.clone()) else {
        return Err(EvError::config(format!(
            "port {port} or queue {queue} has no hardware object"
        )));
    };
    let Some(slot) = p.links.iter_mut().flatten().find(|s| s.queue == queue) else {
        return Ok(());
    };
    shared
        .hw
        .map_qid(shared.domain_id, port_hw, qid, slot.priority >> PRIORITY_SHIFT)
        .map_err(hw_err)?;
    slot.mapped = true;
    if let Some(entry) = port_shared.qid_map.get(qid as usize) {
        entry.store(queue, Ordering::Release);
    }
    Ok(())
}

/// Creates the hardware side of a directed queue on its port, once.
fn bind_directed<H: HwDevice>(
    hw: &H,
    shared: &DomainShared<H>,
    p: &mut PortRecord,
    port: u8,
    queue: u8,
    q: &mut QueueRecord,
) -> EvResult<()> {
    let (Some(port_hw), Some(port_shared)) = (p.hw_id, p.shared.clone()) else {
        // Port not in hardware yet; start binds it.
        return Ok(());
    };
    if q.hw_id.is_none() {
        let qid = hw
            .create_dir_queue(
                shared.domain_id,
                &DirQueueArgs {
                    port_id: Some(port_hw),
                    depth_threshold: q.depth_threshold,
                },
            )
            .map_err(hw_err)?;
        q.hw_id = Some(qid);
        q.bound_port = Some(port);
        log::trace!("directed queue {queue} bound to port {port} as {qid}");
    }
    port_shared.dir_queue.store(u16::from(queue), Ordering::Release);
    if let Some(slot) = p.links[0].as_mut() {
        slot.mapped = true;
    }
    Ok(())
}
