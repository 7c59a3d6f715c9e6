//! Credit subsystem.
//!
//! Two levels bound the work in flight:
//!
//! * software credits: a domain-wide inflight counter capped by the new-event
//!   limit. Ports reserve them in quanta so the shared counter is touched
//!   rarely, and hand surplus back once they hold two quanta;
//! * hardware credits: one or two shared pools (split load-balanced/directed
//!   on V2 devices, combined on V2.5). Ports withdraw a quantum into a local
//!   cache, spend one per new or forwarded event, and get one back per
//!   dequeued event. A cache above two quanta returns the surplus.
//!
//! Shared counters are updated with a single compare-and-swap attempt. A lost
//! race reports exhaustion and leaves the retry decision to the caller.

use crate::error::{EvError, EvResult, Resource};
use hw_iface::DeviceVersion;
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CreditKind {
    Software,
    LoadBalanced,
    Directed,
    Combined,
}

impl fmt::Display for CreditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CreditKind::Software => "software",
            CreditKind::LoadBalanced => "load-balanced",
            CreditKind::Directed => "directed",
            CreditKind::Combined => "combined",
        })
    }
}

/// Shared pool of hardware credits.
#[derive(Debug)]
pub struct CreditPool {
    kind: CreditKind,
    available: AtomicU32,
    max: u32,
}

impl CreditPool {
    pub fn new(kind: CreditKind, max: u32) -> Self {
        Self {
            kind,
            available: AtomicU32::new(max),
            max,
        }
    }

    pub fn kind(&self) -> CreditKind {
        self.kind
    }

    pub fn available(&self) -> u32 {
        self.available.load(Ordering::Acquire)
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Takes up to `quanta` credits in one compare-and-swap; 0 when empty or raced.
    pub fn try_withdraw(&self, quanta: u32) -> u32 {
        let avail = self.available.load(Ordering::Acquire);
        if avail == 0 || quanta == 0 {
            return 0;
        }
        let take = quanta.min(avail);
        match self.available.compare_exchange(
            avail,
            avail - take,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => take,
            Err(_) => 0,
        }
    }

    pub fn deposit(&self, n: u32) {
        if n == 0 {
            return;
        }
        let prev = self.available.fetch_add(n, Ordering::AcqRel);
        debug_assert!(prev + n <= self.max, "{} pool overfilled", self.kind);
    }
}

/// Snapshot of one pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolLevel {
    pub kind: CreditKind,
    pub available: u32,
    pub max: u32,
}

#[derive(Debug)]
pub enum CreditPools {
    Split { ldb: CreditPool, dir: CreditPool },
    Combined(CreditPool),
}

impl CreditPools {
    pub fn new(version: DeviceVersion, ldb: u32, dir: u32) -> Self {
        if version.combined_credits() {
            CreditPools::Combined(CreditPool::new(CreditKind::Combined, ldb))
        } else {
            CreditPools::Split {
                ldb: CreditPool::new(CreditKind::LoadBalanced, ldb),
                dir: CreditPool::new(CreditKind::Directed, dir),
            }
        }
    }

    /// Pool charged for events sent to a queue of the given direction.
    pub fn for_queue(&self, directed: bool) -> &CreditPool {
        match self {
            CreditPools::Split { ldb, dir } => {
                if directed {
                    dir
                } else {
                    ldb
                }
            }
            CreditPools::Combined(pool) => pool,
        }
    }

    pub fn get(&self, kind: CreditKind) -> Option<&CreditPool> {
        match (self, kind) {
            (CreditPools::Split { ldb, .. }, CreditKind::LoadBalanced) => Some(ldb),
            (CreditPools::Split { dir, .. }, CreditKind::Directed) => Some(dir),
            (CreditPools::Combined(pool), CreditKind::Combined) => Some(pool),
            _ => None,
        }
    }

    pub fn levels(&self) -> SmallVec<[PoolLevel; 2]> {
        let level = |p: &CreditPool| PoolLevel {
            kind: p.kind(),
            available: p.available(),
            max: p.max(),
        };
        match self {
            CreditPools::Split { ldb, dir } => smallvec::smallvec![level(ldb), level(dir)],
            CreditPools::Combined(pool) => smallvec::smallvec![level(pool)],
        }
    }
}

/// Domain-wide software inflight counter.
#[derive(Debug)]
pub struct SwCredits {
    inflights: AtomicU32,
    new_event_limit: u32,
}

impl SwCredits {
    pub fn new(new_event_limit: u32) -> Self {
        Self {
            inflights: AtomicU32::new(0),
            new_event_limit,
        }
    }

    pub fn inflights(&self) -> u32 {
        self.inflights.load(Ordering::Acquire)
    }

    pub fn new_event_limit(&self) -> u32 {
        self.new_event_limit
    }

    /// Reserves up to `quanta` credits without crossing the limit, in one
    /// compare-and-swap. Returns the number reserved.
    pub fn try_reserve(&self, quanta: u32) -> u32 {
        let current = self.inflights.load(Ordering::Acquire);
        if current >= self.new_event_limit || quanta == 0 {
            return 0;
        }
        let take = quanta.min(self.new_event_limit - current);
        match self.inflights.compare_exchange(
            current,
            current + take,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => take,
            Err(_) => 0,
        }
    }

    pub fn release(&self, n: u32) {
        if n == 0 {
            return;
        }
        let prev = self.inflights.fetch_sub(n, Ordering::AcqRel);
        debug_assert!(prev >= n, "software inflights underflow");
    }
}

/// Credits a flush handed back to the shared pools.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushedCredits {
    pub software: u32,
    pub hardware: u32,
}

/// Credit state private to one port thread.
///
/// Software credits held by the port live in an atomic shared with the
/// control path (unlink flushes them); hardware caches are plain counters.
#[derive(Debug)]
pub(crate) struct PortCredits {
    /// Load-balanced cache, or the combined cache on V2.5.
    ldb: u32,
    dir: u32,
    hw_quanta: u32,
    sw_quanta: u32,
    new_event_threshold: u32,
}

impl PortCredits {
    pub fn new(hw_quanta: u32, sw_quanta: u32, new_event_threshold: u32) -> Self {
        Self {
            ldb: 0,
            dir: 0,
            hw_quanta,
            sw_quanta,
            new_event_threshold,
        }
    }

    fn slot(&mut self, kind: CreditKind) -> &mut u32 {
        match kind {
            CreditKind::Directed => &mut self.dir,
            _ => &mut self.ldb,
        }
    }

    pub fn cached(&self, kind: CreditKind) -> u32 {
        match kind {
            CreditKind::Directed => self.dir,
            CreditKind::Software => 0,
            _ => self.ldb,
        }
    }

    pub fn cached_hw(&self) -> u32 {
        self.ldb + self.dir
    }

    /// Makes sure at least one credit of `pool` is cached, withdrawing a
    /// quantum when the cache is empty. Nothing is consumed.
    pub fn ensure_hw(&mut self, pool: &CreditPool) -> EvResult<()> {
        let quanta = self.hw_quanta;
        let cached = self.slot(pool.kind());
        if *cached > 0 {
            return Ok(());
        }
        let got = pool.try_withdraw(quanta);
        if got == 0 {
            return Err(EvError::ResourceExhausted(Resource::HardwareCredits(
                pool.kind(),
            )));
        }
        *cached += got;
        Ok(())
    }

    pub fn consume_hw(&mut self, kind: CreditKind) {
        let cached = self.slot(kind);
        debug_assert!(*cached > 0, "consumed an uncached hardware credit");
        *cached -= 1;
    }

    /// Takes back `n` credits freed by dequeued events, returning any surplus
    /// above one quantum once the cache exceeds two.
    pub fn refill_hw(&mut self, pool: &CreditPool, n: u32) {
        let quanta = self.hw_quanta;
        let cached = self.slot(pool.kind());
        *cached += n;
        if *cached > 2 * quanta {
            let surplus = *cached - quanta;
            *cached = quanta;
            pool.deposit(surplus);
        }
    }

    /// Makes sure the port holds a software credit for one new event,
    /// reserving a quantum from the domain when it holds none.
    pub fn ensure_sw(&self, sw: &SwCredits, local: &AtomicU32) -> EvResult<()> {
        if sw.inflights() > self.new_event_threshold {
            return Err(EvError::ResourceExhausted(Resource::SoftwareCredits));
        }
        if local.load(Ordering::Acquire) == 0 {
            let got = sw.try_reserve(self.sw_quanta);
            if got == 0 {
                return Err(EvError::ResourceExhausted(Resource::SoftwareCredits));
            }
            local.fetch_add(got, Ordering::AcqRel);
        }
        Ok(())
    }

    pub fn consume_sw(&self, local: &AtomicU32) -> EvResult<()> {
        local
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .map(|_| ())
            .map_err(|_| EvError::ResourceExhausted(Resource::SoftwareCredits))
    }

    /// Admits one new event against the domain's software limit.
    #[cfg(test)]
    pub fn take_sw(&self, sw: &SwCredits, local: &AtomicU32) -> EvResult<()> {
        self.ensure_sw(sw, local)?;
        self.consume_sw(local)
    }

    /// Returns the software credit of a released event to the port, passing
    /// the surplus back to the domain once two quanta are held.
    pub fn return_sw(&self, sw: &SwCredits, local: &AtomicU32) {
        let held = local.fetch_add(1, Ordering::AcqRel) + 1;
        if held >= 2 * self.sw_quanta {
            let surplus = held - self.sw_quanta;
            if local
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(surplus))
                .is_ok()
            {
                sw.release(surplus);
            }
        }
    }

    /// Hands every cached credit back to the shared pools.
    pub fn flush(&mut self, pools: &CreditPools, sw: &SwCredits, local: &AtomicU32) -> FlushedCredits {
        let software = local.swap(0, Ordering::AcqRel);
        sw.release(software);
        let hardware = self.ldb + self.dir;
        match pools {
            CreditPools::Split { ldb, dir } => {
                ldb.deposit(self.ldb);
                dir.deposit(self.dir);
            }
            CreditPools::Combined(pool) => pool.deposit(self.ldb + self.dir),
        }
        self.ldb = 0;
        self.dir = 0;
        FlushedCredits { software, hardware }
    }
}
