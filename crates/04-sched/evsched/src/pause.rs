//! Back-off policies for the enqueue retry loop.
//!
//! Credit exhaustion is retried in a tight bounded loop. The pause between
//! attempts is injected so tests can substitute [`NoPause`] and run the same
//! code paths deterministically.

/// Called between enqueue attempts that ran out of credits.
pub trait PausePolicy: Send {
    fn pause(&self);
}

/// Spins for a fixed number of CPU relax hints.
#[derive(Clone, Copy, Debug)]
pub struct SpinPause {
    pub spins: u32,
}

impl Default for SpinPause {
    fn default() -> Self {
        Self { spins: 64 }
    }
}

impl PausePolicy for SpinPause {
    fn pause(&self) {
        for _ in 0..self.spins {
            std::hint::spin_loop();
        }
    }
}

/// Gives the rest of the time slice to the scheduler.
#[derive(Clone, Copy, Debug, Default)]
pub struct YieldPause;

impl PausePolicy for YieldPause {
    fn pause(&self) {
        std::thread::yield_now();
    }
}

/// Retries immediately.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPause;

impl PausePolicy for NoPause {
    fn pause(&self) {}
}
