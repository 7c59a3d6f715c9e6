use evsched::{
    DevArgs, DomainConfig, Event, EventDev, EventPort, NoPause, PortConfig, QueueConfig, SchedType,
};
use hw_iface::{SimConfig, SimDevice};
use std::sync::Arc;

pub type Dev = EventDev<SimDevice>;
pub type Port = EventPort<SimDevice>;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn probe(sim: SimConfig, args: DevArgs) -> Dev {
    init_logging();
    EventDev::probe(Arc::new(SimDevice::new(sim)), "evsched0", args).expect("probe")
}

/// Claims `port` with retries that never sleep.
pub fn claim(ev: &Dev, port: u8) -> Port {
    ev.port(port).expect("claim port").with_pause(Box::new(NoPause))
}

/// One atomic queue consumed by port 1; port 0 only produces.
pub fn producer_consumer(limit: u32) -> Dev {
    let ev = probe(SimConfig::v2(), DevArgs::new());
    ev.configure(DomainConfig::new(1, 2).with_events_limit(limit))
        .expect("configure");
    ev.queue_setup(0, QueueConfig::atomic()).expect("queue 0");
    let port = PortConfig::new().with_new_event_threshold(limit);
    ev.port_setup(0, port.clone()).expect("port 0");
    ev.port_setup(1, port).expect("port 1");
    ev.port_link(1, &[(0, 0)]).expect("link");
    ev.start().expect("start");
    ev
}

pub fn new_events(queue: u8, payloads: impl IntoIterator<Item = u64>) -> Vec<Event> {
    payloads
        .into_iter()
        .map(|p| Event::new(queue, SchedType::Atomic, p as u16, p))
        .collect()
}

/// True once every pool is back at its maximum and nothing is in flight.
pub fn credits_settled(ev: &Dev) -> bool {
    let snap = ev.credit_snapshot().expect("domain exists");
    snap.inflights == 0 && snap.pools.iter().all(|p| p.available == p.max)
}
