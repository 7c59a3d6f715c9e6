//! End-to-end scenarios for the event scheduling core, run against the
//! simulated device.

#[cfg(test)]
mod fixtures;

#[cfg(test)]
mod lifecycle_e2e;

#[cfg(test)]
mod datapath_e2e;

#[cfg(test)]
mod ordering_e2e;

#[cfg(all(test, not(target_arch = "wasm32")))]
mod threads_e2e;
