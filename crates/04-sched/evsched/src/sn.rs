//! Sequence-number group selection for ordered queues.

use crate::consts::{NUM_SN_GROUPS, SN_GROUP_CAPACITY};
use hw_iface::HwDevice;

/// Makes a group with `sequences` numbers per queue available, best effort.
///
/// A group already configured for `sequences` with a free slot is reused;
/// otherwise the first empty group is reconfigured. Query or reconfiguration
/// failures, and the case where no group is empty, are logged and otherwise
/// ignored: queue creation then reports the shortage with the device's status.
pub(crate) fn prepare_group<H: HwDevice + ?Sized>(hw: &H, sequences: u32) {
    let mut empty = None;
    for group in 0..NUM_SN_GROUPS as u32 {
        let allocation = match hw.sn_allocation(group) {
            Ok(a) => a,
            Err(err) => {
                log::warn!("sequence-number group {group}: {err}");
                continue;
            }
        };
        let occupancy = match hw.sn_occupancy(group) {
            Ok(o) => o,
            Err(err) => {
                log::warn!("sequence-number group {group}: {err}");
                continue;
            }
        };
        if allocation == sequences && allocation > 0 && occupancy < SN_GROUP_CAPACITY / allocation {
            log::trace!("ordered queue joins sequence-number group {group}");
            return;
        }
        if occupancy == 0 && empty.is_none() {
            empty = Some(group);
        }
    }

    match empty {
        Some(group) => match hw.set_sn_allocation(group, sequences) {
            Ok(()) => log::debug!("sequence-number group {group} now holds {sequences} per queue"),
            Err(err) => log::warn!("reconfiguring sequence-number group {group}: {err}"),
        },
        None => log::warn!(
            "no sequence-number group can supply {sequences} per queue; queue creation will decide"
        ),
    }
}
