//! Class-of-service partitioning of load-balanced ports.

use crate::config::{Cos, DevArgs};
use crate::consts::NUM_COS;
use crate::error::{EvError, EvResult};

/// Load-balanced ports of a domain request, split by class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct CosPlan {
    /// Ports with no class preference.
    pub generic: u32,
    pub per_class: [u32; NUM_COS],
}

impl CosPlan {
    /// Splits `ldb_ports` according to the probe-time class pins.
    ///
    /// A device-wide class takes every port. Otherwise each per-port pin whose
    /// port id falls inside the domain is drawn from its class and the rest
    /// stay generic.
    pub fn new(args: &DevArgs, ldb_ports: u32, event_ports: u32) -> EvResult<Self> {
        let mut plan = CosPlan::default();
        if let Some(cos) = args.cos_id {
            plan.per_class[cos.index()] = ldb_ports;
            return Ok(plan);
        }

        let mut seen = [false; u8::MAX as usize + 1];
        for (port, cos) in args.port_cos.iter().rev() {
            if u32::from(*port) >= event_ports || seen[*port as usize] {
                continue;
            }
            seen[*port as usize] = true;
            plan.per_class[cos.index()] += 1;
        }
        let pinned: u32 = plan.per_class.iter().sum();
        if pinned > ldb_ports {
            return Err(EvError::config(format!(
                "{pinned} ports pinned to a class but only {ldb_ports} load-balanced ports requested"
            )));
        }
        plan.generic = ldb_ports - pinned;
        Ok(plan)
    }

    pub fn total(&self) -> u32 {
        self.generic + self.per_class.iter().sum::<u32>()
    }
}

/// Rejects bandwidth shares that add up to more than the whole device.
pub(crate) fn validate_bandwidth(shares: &[u8; NUM_COS]) -> EvResult<()> {
    let total: u32 = shares.iter().map(|s| u32::from(*s)).sum();
    if total > 100 {
        return Err(EvError::config(format!(
            "class-of-service bandwidth adds up to {total}%"
        )));
    }
    Ok(())
}

/// Class index handed to the device for a port, if pinned.
pub(crate) fn port_class(args: &DevArgs, port: u8) -> Option<u8> {
    args.cos_for_port(port).map(|c: Cos| c.index() as u8)
}
