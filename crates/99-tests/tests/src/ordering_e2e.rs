use crate::fixtures::*;
use evsched::{DevArgs, DomainConfig, Event, PortConfig, QueueConfig, SchedType};
use hw_iface::SimConfig;
use qe_ring::cmd;
use std::time::Duration;

fn independent_port() -> Dev {
    let ev = probe(SimConfig::v2(), DevArgs::new());
    ev.configure(DomainConfig::new(1, 1).with_events_limit(64))
        .expect("configure");
    ev.queue_setup(0, QueueConfig::ordered(64)).expect("queue");
    ev.port_setup(
        0,
        PortConfig::new()
            .with_new_event_threshold(64)
            .with_independent_enqueue(true),
    )
    .expect("port");
    ev.port_link(0, &[(0, 0)]).expect("link");
    ev.start().expect("start");
    ev
}

/// Completions and forwards reach the device in dequeue order, whatever
/// order the application issued them in.
#[test]
fn out_of_order_completions_are_restored() {
    let ev = independent_port();
    let mut port = claim(&ev, 0);
    let events: Vec<Event> = (0..4u64)
        .map(|p| Event::new(0, SchedType::Ordered, p as u16, p))
        .collect();
    port.enqueue_burst(&events).expect("enqueue");
    let mut out = [Event::default(); 4];
    assert_eq!(port.dequeue_burst(&mut out, Duration::ZERO).expect("dequeue"), 4);
    let seqs: Vec<u16> = out.iter().map(|e| e.sequence).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);

    let hw = port.hw_port();
    let issued = |ev: &Dev| -> Vec<u16> {
        ev.hw()
            .command_log(hw)
            .iter()
            .filter(|qe| qe.cmd == cmd::COMP || qe.cmd == cmd::FWD)
            .map(|qe| qe.opaque)
            .collect()
    };

    port.enqueue_burst(&[out[2].into_release()]).expect("release 2");
    port.enqueue_burst(&[out[1].forward_to(0, SchedType::Ordered)])
        .expect("forward 1");
    assert!(issued(&ev).is_empty(), "nothing may pass the oldest event");
    port.enqueue_burst(&[out[0].into_release()]).expect("release 0");
    assert_eq!(issued(&ev), vec![0, 1, 2]);
    port.enqueue_burst(&[out[3].into_release()]).expect("release 3");
    assert_eq!(issued(&ev), vec![0, 1, 2, 3]);
    assert_eq!(port.outstanding(), 0);
}

#[test]
fn eight_releases_leave_in_dequeue_order() {
    let ev = independent_port();
    let mut port = claim(&ev, 0);
    let events: Vec<Event> = (0..8u64)
        .map(|p| Event::new(0, SchedType::Ordered, p as u16, p))
        .collect();
    port.enqueue_burst(&events).expect("enqueue");
    let mut out = [Event::default(); 8];
    assert_eq!(port.dequeue_burst(&mut out, Duration::ZERO).expect("dequeue"), 8);

    for i in [3, 1, 0, 2, 7, 5, 6, 4] {
        port.enqueue_burst(&[out[i].into_release()]).expect("release");
    }
    let payloads: Vec<u64> = ev
        .hw()
        .command_log(port.hw_port())
        .iter()
        .filter(|qe| qe.cmd == cmd::COMP)
        .map(|qe| qe.payload)
        .collect();
    assert_eq!(payloads, (0..8).collect::<Vec<u64>>());
}

#[test]
fn sequence_cannot_be_completed_twice() {
    let ev = independent_port();
    let mut port = claim(&ev, 0);
    let events = [
        Event::new(0, SchedType::Ordered, 1, 1),
        Event::new(0, SchedType::Ordered, 2, 2),
    ];
    port.enqueue_burst(&events).expect("enqueue");
    let mut out = [Event::default(); 2];
    assert_eq!(port.dequeue_burst(&mut out, Duration::ZERO).expect("dequeue"), 2);
    port.enqueue_burst(&[out[1].into_release()]).expect("release 1");
    assert!(port.enqueue_burst(&[out[1].into_release()]).is_err());

    let stray = Event {
        sequence: 9,
        ..out[0].into_release()
    };
    let burst = port.enqueue_burst(&[stray]).expect("enqueue");
    assert_eq!(burst.count, 0);
    assert!(burst.stop.is_some());
}

/// Events left outstanding are completed in order by the next dequeue.
#[test]
fn implicit_release_fills_the_gaps() {
    let ev = independent_port();
    let mut port = claim(&ev, 0);
    let events: Vec<Event> = (0..3u64)
        .map(|p| Event::new(0, SchedType::Ordered, 0, p))
        .collect();
    port.enqueue_burst(&events).expect("enqueue");
    let mut out = [Event::default(); 4];
    assert_eq!(port.dequeue_burst(&mut out, Duration::ZERO).expect("dequeue"), 3);
    port.enqueue_burst(&[out[1].into_release()]).expect("release 1");

    port.dequeue_burst(&mut out, Duration::ZERO).expect("dequeue");
    let comps: Vec<u16> = ev
        .hw()
        .command_log(port.hw_port())
        .iter()
        .filter(|qe| qe.cmd == cmd::COMP)
        .map(|qe| qe.opaque)
        .collect();
    assert_eq!(comps, vec![0, 1, 2]);
    assert_eq!(port.outstanding(), 0);
}
