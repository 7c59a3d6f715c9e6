use crate::fixtures::*;
use evsched::{
    CreditKind, DevArgs, DomainConfig, Event, PortConfig, QueueConfig, SchedType, StopReason,
};
use hw_iface::SimConfig;
use std::time::Duration;

#[test]
fn basic_round_trip() {
    let ev = probe(SimConfig::v2(), DevArgs::new());
    ev.configure(DomainConfig::new(1, 1)).expect("configure");
    ev.queue_setup(0, QueueConfig::atomic()).expect("queue");
    ev.port_setup(0, PortConfig::new()).expect("port");
    ev.port_link(0, &[(0, 0)]).expect("link");
    ev.start().expect("start");

    let mut port = claim(&ev, 0);
    let burst = port.enqueue_burst(&new_events(0, [10, 11, 12, 13])).expect("enqueue");
    assert_eq!(burst, evsched::Burst { count: 4, stop: None });
    let mut out = [Event::default(); 4];
    assert_eq!(port.dequeue_burst(&mut out, Duration::ZERO).expect("dequeue"), 4);
    let flows: Vec<u16> = out.iter().map(|e| e.flow_id).collect();
    assert_eq!(flows, vec![10, 11, 12, 13]);

    let releases: Vec<Event> = out.iter().map(|e| e.into_release()).collect();
    assert_eq!(port.enqueue_burst(&releases).expect("release").count, 4);
    assert_eq!(port.outstanding(), 0);
    // Credits still cached by the port count as inflight until flushed.
    port.flush_credits().expect("flush");
    assert_eq!(ev.credit_snapshot().expect("snapshot").inflights, 0);
}

/// New on an atomic queue, forward to an ordered one, release at the end.
#[test]
fn event_travels_through_two_stages() {
    let ev = probe(SimConfig::v2(), DevArgs::new());
    ev.configure(DomainConfig::new(2, 2).with_events_limit(64))
        .expect("configure");
    ev.queue_setup(0, QueueConfig::atomic()).expect("queue 0");
    ev.queue_setup(1, QueueConfig::ordered(64)).expect("queue 1");
    let cfg = PortConfig::new().with_new_event_threshold(64);
    ev.port_setup(0, cfg.clone()).expect("port 0");
    ev.port_setup(1, cfg).expect("port 1");
    ev.port_link(0, &[(0, 0)]).expect("link 0");
    ev.port_link(1, &[(1, 0)]).expect("link 1");
    ev.start().expect("start");

    let mut stage0 = claim(&ev, 0);
    let mut stage1 = claim(&ev, 1);
    let sent = Event::new(0, SchedType::Atomic, 5, 0xfeed).with_priority(96);
    assert!(stage0.enqueue_burst(&[sent]).expect("new").is_complete());

    let mut out = [Event::default(); 4];
    assert_eq!(stage0.dequeue_burst(&mut out, Duration::ZERO).expect("dequeue"), 1);
    assert_eq!(out[0].queue_id, 0);
    assert_eq!(out[0].priority, 96);
    let fwd = out[0].forward_to(1, SchedType::Ordered);
    assert!(stage0.enqueue_forward_burst(&[fwd]).expect("forward").is_complete());
    assert_eq!(stage0.outstanding(), 0);

    assert_eq!(stage1.dequeue_burst(&mut out, Duration::ZERO).expect("dequeue"), 1);
    assert_eq!(out[0].queue_id, 1);
    assert_eq!(out[0].sched, SchedType::Ordered);
    assert_eq!(out[0].flow_id, 5);
    assert_eq!(out[0].payload, 0xfeed);
    assert!(stage1.enqueue_burst(&[out[0].into_release()]).expect("release").is_complete());

    drop(stage0);
    drop(stage1);
    assert!(credits_settled(&ev));
}

#[test]
fn software_limit_stops_new_events() {
    let ev = producer_consumer(2);
    let mut producer = claim(&ev, 0);
    let burst = producer
        .enqueue_new_burst(&new_events(0, [1, 2, 3]))
        .expect("enqueue");
    assert_eq!(burst.count, 2);
    assert_eq!(burst.stop, Some(StopReason::NoSpace));
    assert_eq!(ev.credit_snapshot().expect("snapshot").inflights, 2);

    // Releasing one event on the consumer makes room for exactly one more.
    let mut consumer = claim(&ev, 1);
    let mut out = [Event::default(); 4];
    assert_eq!(consumer.dequeue_burst(&mut out, Duration::ZERO).expect("dequeue"), 2);
    consumer.enqueue_burst(&[out[0].into_release()]).expect("release");
    consumer.flush_credits().expect("flush");
    let burst = producer
        .enqueue_new_burst(&new_events(0, [4, 5]))
        .expect("enqueue");
    assert_eq!(burst.count, 1);
}

#[test]
fn directed_credit_shortage_reports_its_pool() {
    let ev = probe(SimConfig::v2(), DevArgs::new().with_dir_credits(1));
    ev.configure(DomainConfig::new(2, 2).with_single_link(1).with_events_limit(64))
        .expect("configure");
    ev.queue_setup(0, QueueConfig::atomic()).expect("queue 0");
    ev.queue_setup(1, QueueConfig::single_link()).expect("queue 1");
    ev.port_setup(0, PortConfig::new().with_new_event_threshold(64).with_enqueue_retries(0))
        .expect("port 0");
    ev.port_setup(1, PortConfig::single_link().with_new_event_threshold(64))
        .expect("port 1");
    ev.port_link(0, &[(0, 0)]).expect("link ldb");
    ev.port_link(1, &[(1, 0)]).expect("link dir");
    ev.start().expect("start");

    let mut port = claim(&ev, 0);
    let to_dir = [
        Event::new(1, SchedType::Atomic, 0, 1),
        Event::new(1, SchedType::Atomic, 0, 2),
    ];
    let burst = port.enqueue_burst(&to_dir).expect("enqueue");
    assert_eq!(burst.count, 1);
    assert_eq!(burst.stop, Some(StopReason::NoCredits(CreditKind::Directed)));
    let held = port.cached_sw_credits();
    assert!(held > 0);

    // With the first one, a hundred consecutive short bursts hand the port's
    // credits back.
    for _ in 0..99 {
        let burst = port.enqueue_burst(&to_dir[1..]).expect("enqueue");
        assert_eq!(burst.count, 0);
    }
    assert_eq!(port.cached_sw_credits(), 0);
    assert_eq!(ev.credit_snapshot().expect("snapshot").inflights, 1);

    let mut dir = claim(&ev, 1);
    let mut out = [Event::default(); 2];
    assert_eq!(dir.dequeue_burst(&mut out, Duration::ZERO).expect("dequeue"), 1);
    assert_eq!(out[0].queue_id, 1);
    assert_eq!(out[0].payload, 1);
}

/// An idle port eventually returns what it cached so other ports can run.
#[test]
fn idle_port_returns_cached_credits() {
    let ev = producer_consumer(256);
    let mut producer = claim(&ev, 0);
    producer.enqueue_burst(&new_events(0, [1])).expect("enqueue");
    let cached = producer.cached_hw_credits();
    assert!(cached > 0);
    let pool = |ev: &Dev| {
        ev.credit_snapshot().expect("snapshot").pool(CreditKind::LoadBalanced).expect("ldb").available
    };
    let before = pool(&ev);

    let mut out = [Event::default(); 4];
    for _ in 0..16_383 {
        assert_eq!(producer.dequeue_burst(&mut out, Duration::ZERO).expect("dequeue"), 0);
    }
    assert_eq!(pool(&ev), before);
    producer.dequeue_burst(&mut out, Duration::ZERO).expect("dequeue");
    assert_eq!(pool(&ev), before + cached);
    assert_eq!(producer.cached_hw_credits(), 0);
    assert_eq!(producer.cached_sw_credits(), 0);
}

#[test]
fn implicit_release_frees_the_atomic_flow() {
    let ev = probe(SimConfig::v2(), DevArgs::new());
    ev.configure(DomainConfig::new(1, 2).with_events_limit(64))
        .expect("configure");
    ev.queue_setup(0, QueueConfig::atomic()).expect("queue");
    let cfg = PortConfig::new().with_new_event_threshold(64);
    ev.port_setup(0, cfg.clone()).expect("port 0");
    ev.port_setup(1, cfg).expect("port 1");
    ev.port_link(0, &[(0, 0)]).expect("link 0");
    ev.port_link(1, &[(0, 0)]).expect("link 1");
    ev.start().expect("start");

    let mut a = claim(&ev, 0);
    let mut b = claim(&ev, 1);
    a.enqueue_burst(&new_events(0, [7])).expect("enqueue");
    let mut out = [Event::default(); 4];
    let first = a.dequeue_burst(&mut out, Duration::ZERO).expect("dequeue")
        + b.dequeue_burst(&mut out, Duration::ZERO).expect("dequeue");
    assert_eq!(first, 1);

    // Nothing was released explicitly; the next dequeue on each port does it.
    a.dequeue_burst(&mut out, Duration::ZERO).expect("dequeue");
    b.dequeue_burst(&mut out, Duration::ZERO).expect("dequeue");
    assert_eq!(a.outstanding() + b.outstanding(), 0);
    drop(a);
    drop(b);
    assert!(credits_settled(&ev));
}

#[test]
fn wait_for_write_wakes_on_delivery() {
    let ev = probe(SimConfig::v2().with_wait_for_write(true), DevArgs::new());
    ev.configure(
        DomainConfig::new(1, 2)
            .with_events_limit(64)
            .with_per_dequeue_timeout(true),
    )
    .expect("configure");
    ev.queue_setup(0, QueueConfig::atomic()).expect("queue");
    let cfg = PortConfig::new().with_new_event_threshold(64);
    ev.port_setup(0, cfg.clone()).expect("port 0");
    ev.port_setup(1, cfg).expect("port 1");
    ev.port_link(1, &[(0, 0)]).expect("link");
    ev.start().expect("start");

    let mut producer = claim(&ev, 0);
    let mut consumer = claim(&ev, 1);
    let mut out = [Event::default(); 1];
    assert_eq!(
        consumer.dequeue_burst(&mut out, Duration::from_millis(5)).expect("dequeue"),
        0
    );
    std::thread::scope(|s| {
        s.spawn(|| {
            std::thread::sleep(Duration::from_millis(10));
            producer.enqueue_burst(&new_events(0, [42])).expect("enqueue");
        });
        let n = consumer
            .dequeue_burst(&mut out, Duration::from_secs(5))
            .expect("dequeue");
        assert_eq!(n, 1);
        assert_eq!(out[0].payload, 42);
    });
}

/// A full consumer CQ leaves the rest of the burst queued in the device.
#[test]
fn backlog_shows_in_queue_depth() {
    let ev = producer_consumer(256);
    let mut producer = claim(&ev, 0);
    let events = new_events(0, 0..40);
    assert_eq!(producer.enqueue_burst(&events[..32]).expect("enqueue").count, 32);
    assert_eq!(producer.enqueue_burst(&events[32..]).expect("enqueue").count, 8);
    assert_eq!(ev.queue_depth(0).expect("depth"), 8);

    let mut consumer = claim(&ev, 1);
    let mut out = [Event::default(); 32];
    assert_eq!(consumer.dequeue_burst(&mut out, Duration::ZERO).expect("dequeue"), 32);
    // Completing the first 32 frees the history list for the backlog.
    assert_eq!(consumer.dequeue_burst(&mut out, Duration::ZERO).expect("dequeue"), 8);
    assert_eq!(out[0].payload, 32);
    assert_eq!(ev.queue_depth(0).expect("depth"), 0);
}

/// Start binds every directed queue, so a sender claimed before a relink
/// still reaches it.
#[test]
fn directed_relink_keeps_earlier_senders_routed() {
    let ev = probe(SimConfig::v2(), DevArgs::new());
    ev.configure(DomainConfig::new(2, 2).with_single_link(1).with_events_limit(64))
        .expect("configure");
    ev.queue_setup(0, QueueConfig::atomic()).expect("queue 0");
    ev.queue_setup(1, QueueConfig::single_link()).expect("queue 1");
    ev.port_setup(0, PortConfig::new().with_new_event_threshold(64))
        .expect("port 0");
    ev.port_setup(1, PortConfig::single_link().with_new_event_threshold(64))
        .expect("port 1");
    ev.port_link(0, &[(0, 0)]).expect("link ldb");
    ev.port_link(1, &[(1, 0)]).expect("link dir");
    ev.start().expect("start");

    let mut sender = claim(&ev, 0);
    assert_eq!(ev.port_unlink(1, &[1]).expect("unlink"), 1);
    ev.port_link(1, &[(1, 0)]).expect("relink");
    let burst = sender
        .enqueue_burst(&[Event::new(1, SchedType::Atomic, 0, 77)])
        .expect("enqueue");
    assert!(burst.is_complete());

    let mut dir = claim(&ev, 1);
    let mut out = [Event::default(); 2];
    assert_eq!(dir.dequeue_burst(&mut out, Duration::ZERO).expect("dequeue"), 1);
    assert_eq!(out[0].queue_id, 1);
    assert_eq!(out[0].payload, 77);
}
