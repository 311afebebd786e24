//! Link monitoring.
//!
//! Each monitor tick runs in two phases. Inspection walks every slave, reads
//! the carrier (MII) or the latest probe traffic stamps (ARP), advances the
//! debounce counters and records a proposed transition in `Slave::pending`.
//! Commit applies the proposals, raises the aggregator link hooks and reports
//! whether the active slave has to be reselected. The controller only runs
//! commit when inspection proposed something.
//!
//! ARP monitoring comes in two flavours. Active-backup probes through the
//! active slave only, or, while there is none, through a rotating candidate.
//! The load-balancing modes probe through every slave.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::{ArpAllTargets, ArpParams, MiiParams, Mode, MonitorStrategy};
use crate::device::{Aggregator, LinkDriver, LinkEvent};
use crate::slave::{LinkState, RxStamps, Slave, SlaveId};

/// Extra tolerance past the end of an ARP window, as a fraction of the interval
pub const ARP_WINDOW_SLACK_DIVISOR: u32 = 2;

pub(crate) fn arp_window_slack(interval: Duration) -> Duration {
    interval / ARP_WINDOW_SLACK_DIVISOR
}

/// Whether `last` happened within `multiple` intervals before `now`.
///
/// The window opens one interval before `last` (stamps may be taken on a
/// slightly different clock read than `now`) and closes, exclusive, at
/// `last + multiple * interval + slack`. A missing stamp is never in window.
pub(crate) fn in_window(
    now: Instant,
    last: Option<Instant>,
    multiple: u32,
    interval: Duration,
) -> bool {
    let Some(last) = last else {
        return false;
    };
    let lower = last.checked_sub(interval).unwrap_or(last);
    let upper = last + interval * multiple + arp_window_slack(interval);
    now >= lower && now < upper
}

/// Latest receive time that counts for the ARP monitor.
///
/// With validation in force this is the last validated reply (the oldest
/// per-target reply when every target must answer); otherwise any received
/// frame counts.
pub(crate) fn slave_last_rx(params: &ArpParams, active: bool, rx: &RxStamps) -> Instant {
    if !params.validate.applies_to(active) {
        return rx.last_rx();
    }
    match params.all_targets {
        ArpAllTargets::All => rx.oldest_target_arp_rx().unwrap_or_else(|| rx.last_arp_rx()),
        ArpAllTargets::Any => rx.last_arp_rx(),
    }
}

/// Result of an inspection pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Inspection {
    /// Number of slaves with a proposed transition
    pub proposals: usize,
    /// Some slave's link state changed during inspection itself
    pub relinked: bool,
}

impl Inspection {
    pub fn needs_commit(&self) -> bool {
        self.proposals > 0
    }
}

/// Result of a commit pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Commit {
    pub applied: usize,
    /// The active slave must be reselected
    pub reselect: bool,
}

/// Bond state a monitor pass reads
pub struct TickContext<'a> {
    pub now: Instant,
    pub mode: Mode,
    pub current_active: Option<SlaveId>,
    pub primary: Option<SlaveId>,
    pub driver: &'a dyn LinkDriver,
    pub aggregator: &'a dyn Aggregator,
}

impl TickContext<'_> {
    fn is_current(&self, id: &SlaveId) -> bool {
        self.current_active.as_ref() == Some(id)
    }

    fn is_primary(&self, id: &SlaveId) -> bool {
        self.primary.as_ref() == Some(id)
    }

    fn link_hook(&self, id: &SlaveId, event: LinkEvent) {
        if self.mode.uses_aggregator() {
            self.aggregator.link_changed(id, event);
        }
    }
}

/// Per-bond link monitor
#[derive(Debug)]
pub struct LinkMonitor {
    strategy: MonitorStrategy,
    /// Slave being probed while active-backup ARP has no active slave
    arp_candidate: Option<SlaveId>,
}

impl LinkMonitor {
    pub fn new(strategy: MonitorStrategy) -> Self {
        Self {
            strategy,
            arp_candidate: None,
        }
    }

    pub fn strategy(&self) -> &MonitorStrategy {
        &self.strategy
    }

    pub fn interval(&self) -> Duration {
        self.strategy.interval()
    }

    pub fn arp_candidate(&self) -> Option<&SlaveId> {
        self.arp_candidate.as_ref()
    }

    /// Drop any reference to a slave that is leaving the bond
    pub fn forget(&mut self, id: &SlaveId) {
        if self.arp_candidate.as_ref() == Some(id) {
            self.arp_candidate = None;
        }
    }

    /// Link state (and remaining delay) for a slave being enslaved
    pub fn initial_link(&self, carrier: bool) -> (LinkState, u32) {
        match (&self.strategy, carrier) {
            (_, false) => (LinkState::Down, 0),
            (MonitorStrategy::Mii(p), true) if p.up_delay_ticks > 0 => {
                (LinkState::Back, p.up_delay_ticks)
            }
            (_, true) => (LinkState::Up, 0),
        }
    }

    /// Phase one: read link evidence and propose transitions.
    pub fn inspect(&mut self, slaves: &mut [Slave], ctx: &TickContext<'_>) -> Inspection {
        for slave in slaves.iter_mut() {
            slave.pending = None;
        }
        match &self.strategy {
            MonitorStrategy::Mii(params) => inspect_mii(slaves, params, ctx),
            MonitorStrategy::Arp(params) if ctx.mode == Mode::ActiveBackup => {
                inspect_arp_ab(slaves, params, self.arp_candidate.is_some(), ctx)
            }
            MonitorStrategy::Arp(params) => inspect_arp_lb(slaves, params, ctx),
        }
    }

    /// Phase two: apply the proposals recorded by [`Self::inspect`].
    pub fn commit(&mut self, slaves: &mut [Slave], ctx: &TickContext<'_>) -> Commit {
        match &self.strategy {
            MonitorStrategy::Mii(_) => commit_mii(slaves, ctx),
            MonitorStrategy::Arp(_) if ctx.mode == Mode::ActiveBackup => {
                self.commit_arp_ab(slaves, ctx)
            }
            MonitorStrategy::Arp(_) => commit_arp_lb(slaves, ctx),
        }
    }

    /// Send this tick's ARP probes. Returns whether any link state changed.
    ///
    /// Runs after commit and failover, so `ctx.current_active` reflects the
    /// outcome of this tick. A no-op for MII.
    pub fn probe(&mut self, slaves: &mut [Slave], ctx: &TickContext<'_>) -> bool {
        let MonitorStrategy::Arp(params) = &self.strategy else {
            return false;
        };
        if ctx.mode != Mode::ActiveBackup {
            for slave in slaves.iter_mut() {
                send_probes(slave, &params.targets, ctx);
            }
            return false;
        }
        let targets = params.targets.clone();
        self.probe_ab(slaves, &targets, ctx)
    }

    fn commit_arp_ab(&mut self, slaves: &mut [Slave], ctx: &TickContext<'_>) -> Commit {
        let mut commit = Commit::default();
        let mut retire_candidate = None;

        for slave in slaves.iter_mut() {
            let Some(event) = slave.pending.take() else {
                continue;
            };
            match event {
                LinkEvent::Up => {
                    if ctx.is_current(&slave.id) {
                        continue;
                    }
                    slave.link = LinkState::Up;
                    slave.last_link_change = ctx.now;
                    commit.applied += 1;
                    if let Some(candidate) = self.arp_candidate.take() {
                        retire_candidate = Some(candidate);
                    }
                    info!(slave = %slave.id, "link status definitely up");
                    if ctx.current_active.is_none() || ctx.is_primary(&slave.id) {
                        commit.reselect = true;
                    }
                }
                LinkEvent::Down => {
                    slave.record_failure();
                    slave.link = LinkState::Down;
                    slave.active = false;
                    slave.last_link_change = ctx.now;
                    commit.applied += 1;
                    info!(slave = %slave.id, "link status definitely down, disabling slave");
                    if ctx.is_current(&slave.id) {
                        self.arp_candidate = None;
                        commit.reselect = true;
                    }
                }
            }
        }

        if let Some(candidate) = retire_candidate {
            if let Some(slave) = slaves.iter_mut().find(|s| s.id == candidate) {
                slave.active = false;
            }
        }
        commit
    }

    fn probe_ab(&mut self, slaves: &mut [Slave], targets: &[Ipv4Addr], ctx: &TickContext<'_>) -> bool {
        if let Some(current) = &ctx.current_active {
            if let Some(slave) = slaves.iter_mut().find(|s| &s.id == current) {
                send_probes(slave, targets, ctx);
            }
            return false;
        }

        let candidate = match &self.arp_candidate {
            Some(id) if slaves.iter().any(|s| &s.id == id) => id.clone(),
            _ => match slaves.first() {
                Some(first) => first.id.clone(),
                None => return false,
            },
        };

        let mut relinked = false;
        let mut before = None;
        let mut next = None;
        let mut found = false;
        for (i, slave) in slaves.iter_mut().enumerate() {
            if slave.id == candidate {
                slave.active = false;
            }
            let carrier = ctx.driver.link_up(&slave.id);
            if !found && before.is_none() && carrier {
                before = Some(i);
            }
            if found && next.is_none() && carrier {
                next = Some(i);
            }
            if !carrier && slave.link == LinkState::Up {
                slave.link = LinkState::Down;
                slave.active = false;
                slave.record_failure();
                slave.last_link_change = ctx.now;
                relinked = true;
                info!(slave = %slave.id, "backup interface is now down");
            }
            if slave.id == candidate {
                found = true;
            }
        }

        let Some(idx) = next.or(before) else {
            debug!("no slave with carrier to probe through");
            self.arp_candidate = None;
            return relinked;
        };
        let slave = &mut slaves[idx];
        slave.link = LinkState::Back;
        slave.active = true;
        send_probes(slave, targets, ctx);
        slave.last_link_change = ctx.now;
        self.arp_candidate = Some(slave.id.clone());
        relinked
    }
}

fn send_probes(slave: &mut Slave, targets: &[Ipv4Addr], ctx: &TickContext<'_>) {
    for target in targets {
        match ctx.driver.send_probe(&slave.id, *target) {
            Ok(()) => slave.last_tx = Some(ctx.now),
            Err(e) => debug!(slave = %slave.id, %target, "ARP probe failed: {e}"),
        }
    }
}

fn inspect_mii(slaves: &mut [Slave], params: &MiiParams, ctx: &TickContext<'_>) -> Inspection {
    let ignore_updelay = ctx.current_active.is_none();
    let interval_ms = params.interval.as_millis();
    let mut out = Inspection::default();

    for slave in slaves.iter_mut() {
        let carrier = ctx.driver.link_up(&slave.id);
        match slave.link {
            LinkState::Up | LinkState::Fail => {
                if slave.link == LinkState::Up {
                    if carrier {
                        continue;
                    }
                    slave.link = LinkState::Fail;
                    slave.delay = params.down_delay_ticks;
                    out.relinked = true;
                    if slave.delay > 0 {
                        info!(
                            slave = %slave.id,
                            "link status down, disabling it in {} ms",
                            u128::from(slave.delay) * interval_ms
                        );
                    }
                }
                if carrier {
                    slave.link = LinkState::Up;
                    slave.last_link_change = ctx.now;
                    out.relinked = true;
                    info!(
                        slave = %slave.id,
                        "link status up again after {} ms",
                        u128::from(params.down_delay_ticks.saturating_sub(slave.delay)) * interval_ms
                    );
                    continue;
                }
                if slave.delay == 0 {
                    slave.pending = Some(LinkEvent::Down);
                    out.proposals += 1;
                    continue;
                }
                slave.delay -= 1;
            }
            LinkState::Down | LinkState::Back => {
                if slave.link == LinkState::Down {
                    if !carrier {
                        continue;
                    }
                    slave.link = LinkState::Back;
                    slave.delay = params.up_delay_ticks;
                    out.relinked = true;
                    if slave.delay > 0 {
                        info!(
                            slave = %slave.id,
                            "link status up, enabling it in {} ms",
                            u128::from(slave.delay) * interval_ms
                        );
                    }
                }
                if !carrier {
                    slave.link = LinkState::Down;
                    out.relinked = true;
                    info!(
                        slave = %slave.id,
                        "link status down again after {} ms",
                        u128::from(params.up_delay_ticks.saturating_sub(slave.delay)) * interval_ms
                    );
                    continue;
                }
                if ignore_updelay {
                    slave.delay = 0;
                }
                if slave.delay == 0 {
                    slave.pending = Some(LinkEvent::Up);
                    out.proposals += 1;
                    continue;
                }
                slave.delay -= 1;
            }
        }
    }
    out
}

fn commit_mii(slaves: &mut [Slave], ctx: &TickContext<'_>) -> Commit {
    let mut commit = Commit::default();
    for slave in slaves.iter_mut() {
        let Some(event) = slave.pending.take() else {
            continue;
        };
        commit.applied += 1;
        match event {
            LinkEvent::Up => {
                slave.link = LinkState::Up;
                slave.delay = 0;
                slave.last_link_change = ctx.now;
                slave.refresh_speed_duplex(ctx.driver);
                slave.active = if ctx.mode.uses_primary() {
                    ctx.is_current(&slave.id)
                } else {
                    true
                };
                match (slave.speed, slave.duplex) {
                    (Some(speed), Some(duplex)) => info!(
                        slave = %slave.id,
                        "link status definitely up, {speed} Mbps {duplex} duplex"
                    ),
                    _ => info!(slave = %slave.id, "link status definitely up"),
                }
                ctx.link_hook(&slave.id, LinkEvent::Up);
                if ctx.current_active.is_none() || ctx.is_primary(&slave.id) {
                    commit.reselect = true;
                }
            }
            LinkEvent::Down => {
                slave.record_failure();
                slave.link = LinkState::Down;
                slave.last_link_change = ctx.now;
                if ctx.mode.uses_primary() || ctx.mode == Mode::Lacp {
                    slave.active = false;
                }
                info!(slave = %slave.id, "link status definitely down, disabling slave");
                ctx.link_hook(&slave.id, LinkEvent::Down);
                if ctx.is_current(&slave.id) {
                    commit.reselect = true;
                }
            }
        }
    }
    commit
}

fn inspect_arp_ab(
    slaves: &mut [Slave],
    params: &ArpParams,
    probing_candidate: bool,
    ctx: &TickContext<'_>,
) -> Inspection {
    let interval = params.interval;
    let mut out = Inspection::default();

    for slave in slaves.iter_mut() {
        let last_rx = slave_last_rx(params, slave.active, &slave.rx);

        if slave.link != LinkState::Up {
            if in_window(ctx.now, Some(last_rx), 1, interval) {
                slave.pending = Some(LinkEvent::Up);
                out.proposals += 1;
            }
            continue;
        }

        // Give a freshly changed slave two intervals to settle
        if in_window(ctx.now, Some(slave.last_link_change), 2, interval) {
            continue;
        }

        if !slave.active && !probing_candidate && !in_window(ctx.now, Some(last_rx), 3, interval) {
            slave.pending = Some(LinkEvent::Down);
            out.proposals += 1;
            continue;
        }

        let last_tx = slave.latest_tx(ctx.driver);
        if slave.active
            && (!in_window(ctx.now, last_tx, 2, interval)
                || !in_window(ctx.now, Some(last_rx), 2, interval))
        {
            slave.pending = Some(LinkEvent::Down);
            out.proposals += 1;
        }
    }
    out
}

fn inspect_arp_lb(slaves: &mut [Slave], params: &ArpParams, ctx: &TickContext<'_>) -> Inspection {
    let interval = params.interval;
    let mut out = Inspection::default();

    for slave in slaves.iter_mut() {
        let last_tx = slave.latest_tx(ctx.driver);
        let last_rx = Some(slave.rx.last_rx());
        if slave.link != LinkState::Up {
            if in_window(ctx.now, last_tx, 1, interval) && in_window(ctx.now, last_rx, 1, interval) {
                slave.pending = Some(LinkEvent::Up);
                out.proposals += 1;
            }
        } else if !in_window(ctx.now, last_tx, 2, interval) || !in_window(ctx.now, last_rx, 2, interval)
        {
            slave.pending = Some(LinkEvent::Down);
            out.proposals += 1;
        }
    }
    out
}

fn commit_arp_lb(slaves: &mut [Slave], ctx: &TickContext<'_>) -> Commit {
    let mut commit = Commit::default();
    for slave in slaves.iter_mut() {
        let Some(event) = slave.pending.take() else {
            continue;
        };
        commit.applied += 1;
        match event {
            LinkEvent::Up => {
                slave.link = LinkState::Up;
                slave.active = true;
                slave.last_link_change = ctx.now;
                if ctx.current_active.is_none() {
                    info!(slave = %slave.id, "link status definitely up");
                    commit.reselect = true;
                } else {
                    info!(slave = %slave.id, "interface is now up");
                }
            }
            LinkEvent::Down => {
                slave.link = LinkState::Down;
                slave.active = false;
                slave.record_failure();
                slave.last_link_change = ctx.now;
                info!(slave = %slave.id, "interface is now down");
                if ctx.is_current(&slave.id) {
                    commit.reselect = true;
                }
            }
        }
    }
    commit
}
