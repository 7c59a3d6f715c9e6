//! Dequeue pipeline.

use crate::config::TokenPopMode;
use crate::consts::{QE_BATCH, UNMAPPED_QID, ZERO_DEQUEUE_CREDIT_RETURN_THRES};
use crate::enqueue::{release_qe, QeBatch};
use crate::error::EvResult;
use crate::event::Event;
use crate::port::{EventPort, WaitStrategy};
use hw_iface::HwDevice;
use qe_ring::Qe;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

impl<H: HwDevice> EventPort<H> {
    /// Dequeues up to `out.len()` events, waiting at most `timeout` for the
    /// first one. The domain's global timeout replaces `timeout` unless the
    /// domain was configured for per-call timeouts.
    ///
    /// With implicit release enabled, events still outstanding from the
    /// previous call are released first.
    pub fn dequeue_burst(&mut self, out: &mut [Event], timeout: Duration) -> EvResult<usize> {
        self.ensure_live("dequeue")?;
        let mut batch = QeBatch::new();
        if self.config.token_pop == TokenPopMode::Deferred {
            self.return_tokens(&mut batch)?;
        }
        if self.config.implicit_release && self.outstanding > 0 {
            self.release_outstanding(&mut batch)?;
        }
        self.write_batch(&mut batch)?;

        let max = out.len().min(self.cq.depth() as usize);
        if max == 0 {
            return Ok(0);
        }
        let timeout = self.dequeue_timeout.unwrap_or(timeout);
        let start = Instant::now();
        let deadline = start.checked_add(timeout).unwrap_or(start + Duration::from_secs(3600));
        let mut got;
        loop {
            got = self.poll_cq(&mut out[..max]);
            if got > 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.wait {
                WaitStrategy::BusyPoll => std::hint::spin_loop(),
                WaitStrategy::WaitForWrite => {
                    let bell = self.cq.doorbell();
                    let seen = bell.sequence();
                    if !self.cq.has_entry(&self.cursor) {
                        bell.wait(seen, deadline);
                    }
                }
                WaitStrategy::Interval(interval) => {
                    std::thread::sleep(interval.min(deadline - now));
                }
            }
        }

        if got == 0 {
            self.zero_dequeues += 1;
            if self.zero_dequeues >= ZERO_DEQUEUE_CREDIT_RETURN_THRES {
                log::trace!("port {}: idle, returning cached credits", self.id);
                self.zero_dequeues = 0;
                self.flush_credits()?;
            }
            return Ok(0);
        }
        self.zero_dequeues = 0;
        let n = got as u32;
        let pool = self.domain.pools.for_queue(self.directed);
        self.credits.refill_hw(pool, n);
        self.outstanding += n;
        self.owed_tokens += n;
        if self.config.token_pop == TokenPopMode::Auto {
            self.return_tokens(&mut batch)?;
            self.write_batch(&mut batch)?;
        }
        Ok(got)
    }

    /// Reads as many entries as are valid, window by window, into `out`.
    fn poll_cq(&mut self, out: &mut [Event]) -> usize {
        let mut scratch = [Qe::default(); QE_BATCH];
        let mut n = 0;
        while n < out.len() {
            let want = self.cursor.window(out.len() - n);
            let read = if self.vector_dequeue {
                self.cq.poll_packed(&mut self.cursor, &mut scratch[..want])
            } else {
                self.cq.poll(&mut self.cursor, &mut scratch[..want])
            };
            for qe in &scratch[..read] {
                out[n] = self.decode(qe);
                n += 1;
            }
            if read < want {
                break;
            }
        }
        n
    }

    fn decode(&mut self, qe: &Qe) -> Event {
        let queue_id = if self.directed {
            self.shared.dir_queue.load(Ordering::Acquire) as u8
        } else {
            self.shared
                .qid_map
                .get(qe.qid as usize)
                .map_or(UNMAPPED_QID, |q| q.load(Ordering::Acquire))
        };
        let sequence = self.reorder.as_mut().map_or(0, |r| r.assign());
        Event::from_qe(qe, queue_id, sequence)
    }

    /// Releases every event the application neither forwarded nor released.
    fn release_outstanding(&mut self, batch: &mut QeBatch) -> EvResult<()> {
        let released = match self.reorder.as_mut() {
            Some(buf) => {
                let filled = buf.fill_unready(|seq| release_qe(0, seq));
                self.drain_reorder(batch)?;
                filled.min(self.outstanding)
            }
            None => {
                for _ in 0..self.outstanding {
                    self.push(batch, release_qe(0, 0))?;
                }
                self.outstanding
            }
        };
        for _ in 0..released {
            self.credits
                .return_sw(&self.domain.sw, &self.shared.inflight_credits);
        }
        log::trace!("port {}: {released} implicit releases", self.id);
        self.outstanding -= released;
        if let TokenPopMode::Delayed { threshold } = self.config.token_pop {
            self.issued_completions += released;
            if self.issued_completions >= threshold {
                self.issued_completions = 0;
                self.return_tokens(batch)?;
            }
        }
        Ok(())
    }
}
