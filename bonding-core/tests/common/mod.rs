//! Recording fake collaborators for integration tests.

#![allow(dead_code)]

use bonding_core::{
    Aggregator, CollaboratorError, Collaborators, Duplex, HostStack, LinkDriver, LinkEvent,
    MacAddr, SlaveId, SlaveSpec,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

/// Everything the fake observed, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Carrier(bool),
    NotifyPeers,
    Failover(SlaveId),
    BondAddress(MacAddr),
    Probe(SlaveId, Ipv4Addr),
    SetMac(SlaveId, MacAddr),
    Promisc(SlaveId, i32),
    Allmulti(SlaveId, i32),
    AggAttached(SlaveId),
    AggDetached(SlaveId),
    AggLink(SlaveId, LinkEvent),
    AggActive(Option<SlaveId>),
}

#[derive(Default)]
struct State {
    carrier: HashMap<SlaveId, bool>,
    speed: HashMap<SlaveId, (u32, Duplex)>,
    last_tx: HashMap<SlaveId, Instant>,
    refuse_mac: HashSet<SlaveId>,
    refuse_attach: HashSet<SlaveId>,
    events: Vec<Event>,
}

/// A fake network: link driver, host stack and aggregator in one
#[derive(Default)]
pub struct FakeNet {
    state: Mutex<State>,
}

impl FakeNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_link(&self, name: &str, up: bool) {
        self.state.lock().carrier.insert(SlaveId::new(name), up);
    }

    pub fn set_speed(&self, name: &str, speed: u32, duplex: Duplex) {
        self.state.lock().speed.insert(SlaveId::new(name), (speed, duplex));
    }

    pub fn set_last_tx(&self, name: &str, at: Instant) {
        self.state.lock().last_tx.insert(SlaveId::new(name), at);
    }

    pub fn refuse_mac(&self, name: &str) {
        self.state.lock().refuse_mac.insert(SlaveId::new(name));
    }

    pub fn refuse_attach(&self, name: &str) {
        self.state.lock().refuse_attach.insert(SlaveId::new(name));
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn carrier_events(&self) -> Vec<bool> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Carrier(up) => Some(up),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.state.lock().events.iter().filter(|e| pred(e)).count()
    }

    fn record(&self, event: Event) {
        self.state.lock().events.push(event);
    }
}

impl LinkDriver for FakeNet {
    fn link_up(&self, slave: &SlaveId) -> bool {
        self.state.lock().carrier.get(slave).copied().unwrap_or(false)
    }

    fn speed_duplex(&self, slave: &SlaveId) -> Option<(u32, Duplex)> {
        self.state.lock().speed.get(slave).copied()
    }

    fn last_tx(&self, slave: &SlaveId) -> Option<Instant> {
        self.state.lock().last_tx.get(slave).copied()
    }

    fn send_probe(&self, slave: &SlaveId, target: Ipv4Addr) -> Result<(), CollaboratorError> {
        self.record(Event::Probe(slave.clone(), target));
        Ok(())
    }

    fn set_hw_address(&self, slave: &SlaveId, addr: MacAddr) -> Result<(), CollaboratorError> {
        if self.state.lock().refuse_mac.contains(slave) {
            return Err(CollaboratorError::Rejected {
                device: slave.clone(),
                operation: "set_hw_address",
                reason: "device busy".into(),
            });
        }
        self.record(Event::SetMac(slave.clone(), addr));
        Ok(())
    }

    fn set_promiscuity(&self, slave: &SlaveId, delta: i32) -> Result<(), CollaboratorError> {
        self.record(Event::Promisc(slave.clone(), delta));
        Ok(())
    }

    fn set_allmulti(&self, slave: &SlaveId, delta: i32) -> Result<(), CollaboratorError> {
        self.record(Event::Allmulti(slave.clone(), delta));
        Ok(())
    }
}

impl HostStack for FakeNet {
    fn carrier_changed(&self, _bond: &str, up: bool) {
        self.record(Event::Carrier(up));
    }

    fn notify_peers(&self, _bond: &str) {
        self.record(Event::NotifyPeers);
    }

    fn failover(&self, _bond: &str, active: &SlaveId) {
        self.record(Event::Failover(active.clone()));
    }

    fn bond_address_changed(&self, _bond: &str, addr: MacAddr) {
        self.record(Event::BondAddress(addr));
    }
}

impl Aggregator for FakeNet {
    fn slave_attached(&self, slave: &SlaveId) -> Result<(), CollaboratorError> {
        if self.state.lock().refuse_attach.contains(slave) {
            return Err(CollaboratorError::Unavailable(slave.clone()));
        }
        self.record(Event::AggAttached(slave.clone()));
        Ok(())
    }

    fn slave_detached(&self, slave: &SlaveId) {
        self.record(Event::AggDetached(slave.clone()));
    }

    fn link_changed(&self, slave: &SlaveId, event: LinkEvent) {
        self.record(Event::AggLink(slave.clone(), event));
    }

    fn active_changed(&self, active: Option<&SlaveId>) {
        self.record(Event::AggActive(active.cloned()));
    }
}

pub fn collaborators(net: &Arc<FakeNet>) -> Collaborators {
    Collaborators::new(net.clone(), net.clone()).with_aggregator(net.clone())
}

pub fn mac(last: u8) -> MacAddr {
    MacAddr::new([0x02, 0, 0, 0, 0, last])
}

pub fn spec(name: &str, last: u8) -> SlaveSpec {
    SlaveSpec::new(name, mac(last))
}

pub fn id(name: &str) -> SlaveId {
    SlaveId::new(name)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Ethernet frame with the given last address octets and a bare IPv4 ethertype
pub fn l2_frame(dst_last: u8, src_last: u8) -> Vec<u8> {
    let mut buf = vec![0u8; 14];
    buf[5] = dst_last;
    buf[11] = src_last;
    buf[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
    buf
}
