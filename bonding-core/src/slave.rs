//! Member links ("slaves") of a bond and their per-link monitor state.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::device::{Duplex, LinkDriver, LinkEvent, MacAddr};

/// Stable identity of a slave device (its interface name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlaveId(Arc<str>);

impl SlaveId {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SlaveId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for SlaveId {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

/// Debounced link state of a slave.
///
/// `Fail` and `Back` are the transitional states in which the down/up
/// delay is counting; neither can carry traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Up,
    Fail,
    Down,
    Back,
}

impl LinkState {
    pub fn name(&self) -> &'static str {
        match self {
            LinkState::Up => "up",
            LinkState::Fail => "going down",
            LinkState::Down => "down",
            LinkState::Back => "going back",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything needed to enslave a device
#[derive(Debug, Clone)]
pub struct SlaveSpec {
    pub id: SlaveId,
    /// Factory hardware address, restored on release
    pub perm_hw_addr: MacAddr,
    /// Transmit queue pinned to this slave (0 = none)
    pub queue_id: u16,
}

impl SlaveSpec {
    pub fn new(id: impl Into<SlaveId>, perm_hw_addr: MacAddr) -> Self {
        Self {
            id: id.into(),
            perm_hw_addr,
            queue_id: 0,
        }
    }

    pub fn with_queue_id(mut self, queue_id: u16) -> Self {
        self.queue_id = queue_id;
        self
    }
}

/// Receive timestamps of a slave.
///
/// Written by the receive path without the bond's writer lock and read by
/// the monitor. The registry and every published snapshot share one
/// instance per slave. Each stamp is a signed nanosecond offset from
/// `epoch`.
#[derive(Debug)]
pub struct RxStamps {
    epoch: Instant,
    last_rx: AtomicI64,
    last_arp_rx: AtomicI64,
    targets: Box<[AtomicI64]>,
}

impl RxStamps {
    pub(crate) fn new(epoch: Instant, initial: Instant, targets: usize) -> Self {
        let start = offset_from(epoch, initial);
        Self {
            epoch,
            last_rx: AtomicI64::new(start),
            last_arp_rx: AtomicI64::new(start),
            targets: (0..targets).map(|_| AtomicI64::new(start)).collect(),
        }
    }

    fn instant(&self, offset: i64) -> Instant {
        let delta = Duration::from_nanos(offset.unsigned_abs());
        if offset >= 0 {
            self.epoch.checked_add(delta).unwrap_or(self.epoch)
        } else {
            self.epoch.checked_sub(delta).unwrap_or(self.epoch)
        }
    }

    fn load(&self, cell: &AtomicI64) -> Instant {
        self.instant(cell.load(Ordering::Relaxed))
    }

    fn store(&self, cell: &AtomicI64, at: Instant) {
        cell.store(offset_from(self.epoch, at), Ordering::Relaxed);
    }

    /// Last frame of any kind
    pub fn last_rx(&self) -> Instant {
        self.load(&self.last_rx)
    }

    pub(crate) fn set_last_rx(&self, at: Instant) {
        self.store(&self.last_rx, at);
    }

    /// Last validated ARP reply from any target
    pub fn last_arp_rx(&self) -> Instant {
        self.load(&self.last_arp_rx)
    }

    pub(crate) fn set_last_arp_rx(&self, at: Instant) {
        self.store(&self.last_arp_rx, at);
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Last validated reply from the target at `index`
    pub fn target_last_arp_rx(&self, index: usize) -> Option<Instant> {
        self.targets.get(index).map(|cell| self.load(cell))
    }

    pub(crate) fn set_target_last_arp_rx(&self, index: usize, at: Instant) {
        if let Some(cell) = self.targets.get(index) {
            self.store(cell, at);
        }
    }

    /// Oldest per-target reply, `None` without targets
    pub fn oldest_target_arp_rx(&self) -> Option<Instant> {
        self.targets
            .iter()
            .map(|cell| cell.load(Ordering::Relaxed))
            .min()
            .map(|offset| self.instant(offset))
    }
}

fn offset_from(epoch: Instant, at: Instant) -> i64 {
    match at.checked_duration_since(epoch) {
        Some(after) => i64::try_from(after.as_nanos()).unwrap_or(i64::MAX),
        None => -i64::try_from(epoch.duration_since(at).as_nanos()).unwrap_or(i64::MAX),
    }
}

/// A member link.
///
/// Owned exclusively by the slave registry; mutated only under the bond's
/// writer lock, except for the receive stamps in [`RxStamps`].
#[derive(Debug, Clone)]
pub struct Slave {
    pub(crate) id: SlaveId,
    pub(crate) perm_hw_addr: MacAddr,
    pub(crate) hw_addr: MacAddr,
    pub(crate) queue_id: u16,
    pub(crate) link: LinkState,
    /// Transition proposed by inspection, applied by commit
    pub(crate) pending: Option<LinkEvent>,
    /// Remaining debounce ticks while in `Fail` or `Back`
    pub(crate) delay: u32,
    pub(crate) active: bool,
    pub(crate) is_primary: bool,
    pub(crate) speed: Option<u32>,
    pub(crate) duplex: Option<Duplex>,
    pub(crate) last_link_change: Instant,
    pub(crate) last_tx: Option<Instant>,
    pub(crate) rx: Arc<RxStamps>,
    pub(crate) failure_count: u32,
}

impl Slave {
    /// Build a detached slave in the `Down` state.
    ///
    /// When ARP monitoring is configured, receive stamps start just outside
    /// the one-interval validity window so a fresh slave is not considered
    /// alive until a reply actually arrives.
    pub(crate) fn new(
        spec: SlaveSpec,
        now: Instant,
        arp: Option<(Duration, usize)>,
    ) -> Self {
        let (stale, targets) = match arp {
            Some((interval, targets)) => {
                let age = interval + crate::monitor::arp_window_slack(interval);
                (now.checked_sub(age).unwrap_or(now), targets)
            }
            None => (now, 0),
        };
        Self {
            id: spec.id,
            perm_hw_addr: spec.perm_hw_addr,
            hw_addr: spec.perm_hw_addr,
            queue_id: spec.queue_id,
            link: LinkState::Down,
            pending: None,
            delay: 0,
            active: false,
            is_primary: false,
            speed: None,
            duplex: None,
            last_link_change: now,
            last_tx: None,
            rx: Arc::new(RxStamps::new(now, stale, targets)),
            failure_count: 0,
        }
    }

    pub fn id(&self) -> &SlaveId {
        &self.id
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn perm_hw_addr(&self) -> MacAddr {
        self.perm_hw_addr
    }

    pub fn hw_addr(&self) -> MacAddr {
        self.hw_addr
    }

    pub fn queue_id(&self) -> u16 {
        self.queue_id
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn rx_stamps(&self) -> &RxStamps {
        &self.rx
    }

    /// Usable for transmit: link up and allowed to carry traffic
    pub fn can_transmit(&self) -> bool {
        self.link == LinkState::Up && self.active
    }

    pub(crate) fn record_failure(&mut self) {
        self.failure_count = self.failure_count.saturating_add(1);
    }

    pub(crate) fn refresh_speed_duplex(&mut self, driver: &dyn LinkDriver) {
        let reported = driver.speed_duplex(&self.id);
        self.speed = reported.map(|(speed, _)| speed);
        self.duplex = reported.map(|(_, duplex)| duplex);
    }

    /// Newest transmit stamp, ours or the driver's
    pub(crate) fn latest_tx(&self, driver: &dyn LinkDriver) -> Option<Instant> {
        match (self.last_tx, driver.last_tx(&self.id)) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn info(&self) -> SlaveInfo {
        SlaveInfo {
            id: self.id.clone(),
            link: self.link,
            active: self.active,
            is_primary: self.is_primary,
            speed: self.speed,
            duplex: self.duplex,
            failure_count: self.failure_count,
            queue_id: self.queue_id,
            perm_hw_addr: self.perm_hw_addr,
            hw_addr: self.hw_addr,
        }
    }
}

/// Point-in-time status of one slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveInfo {
    pub id: SlaveId,
    pub link: LinkState,
    pub active: bool,
    pub is_primary: bool,
    pub speed: Option<u32>,
    pub duplex: Option<Duplex>,
    pub failure_count: u32,
    pub queue_id: u16,
    pub perm_hw_addr: MacAddr,
    pub hw_addr: MacAddr,
}
