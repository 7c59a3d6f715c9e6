use crate::fixtures::*;
use evsched::{
    ConfigState, DevArgs, DevState, DomainConfig, EvError, PortConfig, QueueConfig,
};
use hw_iface::SimConfig;
use std::time::Duration;

fn one_queue_one_port(ev: &Dev, config: DomainConfig) {
    ev.configure(config).expect("configure");
    ev.queue_setup(0, QueueConfig::atomic()).expect("queue");
    ev.port_setup(0, PortConfig::new()).expect("port");
    ev.port_link(0, &[(0, 64)]).expect("link");
}

#[test]
fn reconfigure_with_new_shape_tears_everything_down() {
    let ev = probe(SimConfig::v2(), DevArgs::new());
    one_queue_one_port(&ev, DomainConfig::new(1, 1));
    ev.start().expect("start");
    {
        let mut port = claim(&ev, 0);
        let burst = port.enqueue_burst(&new_events(0, [1, 2, 3])).expect("enqueue");
        assert_eq!(burst.count, 3);
    }
    ev.stop().expect("stop");
    assert_eq!(ev.state(), DevState::Stopped);

    ev.configure(DomainConfig::new(2, 2)).expect("reconfigure");
    assert_eq!(ev.state(), DevState::Configured);
    assert_eq!(ev.queue_state(0), Some(ConfigState::NotConfigured));
    assert_eq!(ev.port_state(0), Some(ConfigState::NotConfigured));
    assert!(ev.port_links(0).expect("links").is_empty());
    assert_eq!(ev.queue_links(0), Some(0));
    assert!(credits_settled(&ev));
}

/// Stop then start brings back the same queues, ports and links.
#[test]
fn restart_recreates_previous_setup() {
    let ev = probe(SimConfig::v2(), DevArgs::new());
    one_queue_one_port(&ev, DomainConfig::new(1, 1));
    ev.start().expect("start");
    let stale = claim(&ev, 0);
    ev.stop().expect("stop");
    assert_eq!(ev.queue_state(0), Some(ConfigState::PrevConfigured));
    assert_eq!(ev.port_links(0).expect("links"), vec![(0, 64)]);

    let mut stale = stale;
    assert!(matches!(
        stale.enqueue_burst(&new_events(0, [1])),
        Err(EvError::InvalidState { .. })
    ));
    drop(stale);

    ev.start().expect("restart");
    assert_eq!(ev.queue_state(0), Some(ConfigState::Configured));
    let mut port = claim(&ev, 0);
    port.enqueue_burst(&new_events(0, [9])).expect("enqueue");
    let mut out = [evsched::Event::default(); 4];
    assert_eq!(port.dequeue_burst(&mut out, Duration::ZERO).expect("dequeue"), 1);
    assert_eq!(out[0].payload, 9);
    assert_eq!(out[0].priority, 0);
}

#[test]
fn same_shape_reconfigure_keeps_links_for_the_next_start() {
    let ev = probe(SimConfig::v2_5(), DevArgs::new());
    one_queue_one_port(&ev, DomainConfig::new(1, 1));
    ev.configure(DomainConfig::new(1, 1).with_events_limit(128))
        .expect("reconfigure");
    assert_eq!(ev.queue_state(0), Some(ConfigState::PrevConfigured));
    assert_eq!(ev.queue_links(0), Some(1));
    ev.start().expect("start");
    let snap = ev.credit_snapshot().expect("snapshot");
    assert_eq!(snap.new_event_limit, 128);
    assert_eq!(snap.pools.len(), 1);
}

#[test]
fn start_needs_every_queue_linked() {
    let ev = probe(SimConfig::v2(), DevArgs::new());
    ev.configure(DomainConfig::new(2, 1)).expect("configure");
    ev.queue_setup(0, QueueConfig::atomic()).expect("queue 0");
    ev.queue_setup(1, QueueConfig::unordered()).expect("queue 1");
    ev.port_setup(0, PortConfig::new()).expect("port");
    ev.port_link(0, &[(0, 0)]).expect("link");
    assert!(matches!(ev.start(), Err(EvError::Config(_))));
    ev.port_link(0, &[(1, 0)]).expect("link");
    ev.start().expect("start");
    assert!(matches!(ev.configure(DomainConfig::new(2, 1)), Err(EvError::InvalidState { .. })));
    ev.close();
    assert_eq!(ev.state(), DevState::Unconfigured);
    assert!(ev.credit_snapshot().is_none());
}

#[test]
fn directed_pairs_are_exclusive() {
    let ev = probe(SimConfig::v2(), DevArgs::new());
    ev.configure(DomainConfig::new(2, 2).with_single_link(2))
        .expect("configure");
    ev.queue_setup(0, QueueConfig::single_link()).expect("queue 0");
    ev.queue_setup(1, QueueConfig::single_link()).expect("queue 1");
    ev.port_setup(0, PortConfig::single_link()).expect("port 0");
    ev.port_setup(1, PortConfig::single_link()).expect("port 1");

    assert_eq!(ev.port_link(0, &[(0, 0)]).expect("link"), 1);
    // Relinking the same pair is harmless.
    assert_eq!(ev.port_link(0, &[(0, 0)]).expect("relink"), 1);
    match ev.port_link(1, &[(0, 0)]) {
        Err(EvError::LinkFailed { index: 0, source, .. }) => {
            assert!(matches!(*source, EvError::Config(_)));
        }
        other => panic!("queue 0 linked twice: {other:?}"),
    }
    assert!(ev.port_link(0, &[(1, 0)]).is_err());

    ev.port_unlink(0, &[0]).expect("unlink");
    assert!(
        ev.port_link(1, &[(0, 0)]).is_err(),
        "directed queue stays bound to its first port"
    );
    ev.port_link(0, &[(0, 0)]).expect("link back");
    ev.port_link(1, &[(1, 0)]).expect("link other pair");
    ev.start().expect("start");
}

#[test]
fn unlink_is_idempotent() {
    let ev = probe(SimConfig::v2(), DevArgs::new());
    ev.configure(DomainConfig::new(2, 1)).expect("configure");
    ev.queue_setup(0, QueueConfig::atomic()).expect("queue 0");
    ev.queue_setup(1, QueueConfig::atomic()).expect("queue 1");
    ev.port_setup(0, PortConfig::new()).expect("port");
    ev.port_link(0, &[(0, 0), (1, 32)]).expect("link");
    ev.start().expect("start");

    assert_eq!(ev.port_unlink(0, &[1]).expect("unlink"), 1);
    assert_eq!(ev.port_unlink(0, &[1]).expect("unlink again"), 1);
    assert_eq!(ev.queue_links(1), Some(0));
    assert_eq!(ev.port_links(0).expect("links"), vec![(0, 0)]);

    // Linking again while running maps right away.
    ev.port_link(0, &[(1, 32)]).expect("relink");
    assert_eq!(ev.queue_links(1), Some(1));
}

#[test]
fn info_reports_device_limits() {
    let ev = probe(SimConfig::v2(), DevArgs::new().with_max_num_events(2048));
    let info = ev.info().expect("info");
    assert_eq!(info.max_num_events, 2048);
    assert_eq!(info.max_event_port_links, 8);
    ev.configure(DomainConfig::new(4, 4).with_events_limit(2048))
        .expect("configure");
    assert_eq!(ev.info().expect("info"), info);
    assert!(ev
        .configure(DomainConfig::new(4, 4).with_events_limit(4096))
        .is_err());
    assert_eq!(ev.state(), DevState::Unconfigured);
}
