use crate::fixtures::*;
use evsched::{
    DevArgs, DomainConfig, Event, PortConfig, PortHint, QueueConfig, SchedType, YieldPause,
};
use hw_iface::SimConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const EVENTS: u64 = 20_000;

fn pipeline(workers: u8) -> Dev {
    let ev = probe(SimConfig::v2(), DevArgs::new());
    ev.configure(DomainConfig::new(1, u32::from(workers) + 1).with_events_limit(1024))
        .expect("configure");
    ev.queue_setup(0, QueueConfig::atomic()).expect("queue");
    ev.port_setup(
        0,
        PortConfig::new()
            .with_new_event_threshold(1024)
            .with_hint(PortHint::Producer),
    )
    .expect("producer port");
    for w in 1..=workers {
        ev.port_setup(w, PortConfig::new().with_new_event_threshold(1024))
            .expect("worker port");
        ev.port_link(w, &[(0, 0)]).expect("link");
    }
    ev.start().expect("start");
    ev
}

/// One producer, several workers: every event arrives exactly once and all
/// credits come home afterwards.
#[test]
fn producer_and_workers_share_credits() {
    let workers = 3u8;
    let ev = pipeline(workers);
    let received = Arc::new(AtomicUsize::new(0));
    let payloads = Arc::new(Mutex::new(Vec::with_capacity(EVENTS as usize)));

    let mut producer = ev
        .port(0)
        .expect("producer")
        .with_pause(Box::new(YieldPause));
    let handles: Vec<_> = (1..=workers)
        .map(|w| {
            let mut port = claim(&ev, w);
            let received = Arc::clone(&received);
            let payloads = Arc::clone(&payloads);
            thread::spawn(move || {
                let mut out = [Event::default(); 16];
                let mut local = Vec::new();
                while received.load(Ordering::Acquire) < EVENTS as usize {
                    let n = port
                        .dequeue_burst(&mut out, Duration::ZERO)
                        .expect("dequeue");
                    if n == 0 {
                        thread::yield_now();
                        continue;
                    }
                    local.extend(out[..n].iter().map(|e| e.payload));
                    received.fetch_add(n, Ordering::AcqRel);
                }
                // Release whatever is still outstanding before handing the port back.
                port.dequeue_burst(&mut out, Duration::ZERO).expect("final dequeue");
                payloads.lock().extend(local);
            })
        })
        .collect();

    let events: Vec<Event> = (0..EVENTS)
        .map(|p| Event::new(0, SchedType::Atomic, p as u16, p))
        .collect();
    let mut sent = 0;
    while sent < events.len() {
        let end = (sent + 32).min(events.len());
        let burst = producer.enqueue_burst(&events[sent..end]).expect("enqueue");
        sent += burst.count;
        if burst.count == 0 {
            thread::yield_now();
        }
    }
    for handle in handles {
        handle.join().expect("worker");
    }
    drop(producer);

    let mut got = payloads.lock().clone();
    got.sort_unstable();
    assert_eq!(got, (0..EVENTS).collect::<Vec<_>>());
    assert!(credits_settled(&ev));
}
