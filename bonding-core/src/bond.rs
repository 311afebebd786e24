//! Bond controller.
//!
//! [`Bond`] owns the slave registry, the link monitor and the active-slave
//! pointer. Every mutation (enslave, release, monitor commit, failover, probe
//! bookkeeping) happens under a single writer lock. Once a mutation is
//! complete a fresh [`RegistrySnapshot`] is published for the transmit and
//! receive paths, which never take the lock. Receive stamps go straight into
//! the slave's shared [`RxStamps`](crate::slave::RxStamps).
//!
//! Monitor ticks only `try_lock` the writer side: a tick that finds a
//! lifecycle operation in progress is skipped, and the next one picks up.

use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{BondConfig, BondParams, ConfigError, FailOverMac, Mode, MonitorStrategy};
use crate::device::{Collaborators, CollaboratorError, LinkEvent, MacAddr};
use crate::failover::FailoverPolicy;
use crate::frame::Frame;
use crate::monitor::{slave_last_rx, LinkMonitor, TickContext};
use crate::registry::{RegistryError, RegistrySnapshot, SlaveRegistry, SnapshotReader};
use crate::slave::{LinkState, Slave, SlaveId, SlaveInfo, SlaveSpec};
use crate::xmit::{TransmitDistributor, TxDecision};

/// Bond controller errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BondError {
    #[error("{0} is already enslaved")]
    AlreadyEnslaved(SlaveId),

    #[error("{0} is not enslaved")]
    NotFound(SlaveId),

    #[error("invalid configuration: {0}")]
    ConfigConflict(#[from] ConfigError),

    #[error(transparent)]
    CollaboratorFailure(#[from] CollaboratorError),

    #[error("{0} mode has no single active slave")]
    NoActiveSlave(Mode),

    #[error("{0} cannot become active, link is not up")]
    LinkNotUp(SlaveId),

    #[error("bond {0} already exists")]
    BondExists(String),

    #[error("no such bond: {0}")]
    UnknownBond(String),
}

impl From<RegistryError> for BondError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyEnslaved(id) => BondError::AlreadyEnslaved(id),
            RegistryError::NotFound(id) => BondError::NotFound(id),
        }
    }
}

/// What a monitor tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A lifecycle operation held the lock; nothing was inspected
    Skipped,
    /// Inspection found nothing to commit
    Idle,
    /// Proposals were committed
    Committed { applied: usize },
}

/// Point-in-time status of a bond
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondInfo {
    pub name: String,
    pub mode: Mode,
    pub carrier_up: bool,
    pub slave_count: usize,
    pub current_active: Option<SlaveId>,
    pub primary: Option<SlaveId>,
    pub hw_addr: Option<MacAddr>,
    pub arp_candidate: Option<SlaveId>,
}

struct BondState {
    registry: SlaveRegistry,
    monitor: LinkMonitor,
    current_active: Option<SlaveId>,
    primary: Option<SlaveId>,
    /// Next selection must let the freshly enslaved primary take over
    force_primary: bool,
    carrier_up: bool,
    peer_notify_remaining: u8,
    hw_addr: Option<MacAddr>,
}

/// A link-aggregation group
pub struct Bond {
    name: String,
    params: BondParams,
    policy: FailoverPolicy,
    distributor: TransmitDistributor,
    collaborators: Collaborators,
    state: Mutex<BondState>,
    reader: SnapshotReader,
}

impl std::fmt::Debug for Bond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bond")
            .field("name", &self.name)
            .field("mode", &self.params.mode)
            .finish_non_exhaustive()
    }
}

impl Bond {
    /// Validate `config` and create an empty bond.
    pub fn new(
        name: impl Into<String>,
        config: &BondConfig,
        collaborators: Collaborators,
    ) -> Result<Self, BondError> {
        let params = config.validate()?;
        Ok(Self::with_params(name, params, collaborators))
    }

    pub fn with_params(name: impl Into<String>, params: BondParams, collaborators: Collaborators) -> Self {
        let name = name.into();
        let registry = SlaveRegistry::new();
        let reader = registry.reader();
        let state = BondState {
            registry,
            monitor: LinkMonitor::new(params.monitor.clone()),
            current_active: None,
            primary: None,
            force_primary: false,
            carrier_up: false,
            peer_notify_remaining: 0,
            hw_addr: params.hw_addr,
        };
        info!(
            bond = %name,
            mode = %params.mode,
            interval_ms = params.monitor.interval().as_millis() as u64,
            "bond created"
        );
        Self {
            policy: FailoverPolicy::new(params.reselect),
            distributor: TransmitDistributor::new(&params),
            name,
            params,
            collaborators,
            state: Mutex::new(state),
            reader,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> Mode {
        self.params.mode
    }

    pub fn params(&self) -> &BondParams {
        &self.params
    }

    /// Latest published registry snapshot
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.reader.load()
    }

    /// Pick the slave(s) for an outgoing frame. Lock-free.
    pub fn transmit(&self, frame: &Frame<'_>) -> Option<TxDecision> {
        self.transmit_with(frame, &self.reader.load())
    }

    /// Like [`Self::transmit`], against a snapshot the caller already holds.
    pub fn transmit_with(&self, frame: &Frame<'_>, snapshot: &RegistrySnapshot) -> Option<TxDecision> {
        self.distributor
            .select(frame, snapshot, self.collaborators.aggregator.as_ref())
    }

    pub fn current_active(&self) -> Option<SlaveId> {
        self.state.lock().current_active.clone()
    }

    pub fn carrier_up(&self) -> bool {
        self.state.lock().carrier_up
    }

    pub fn slave_ids(&self) -> Vec<SlaveId> {
        self.state.lock().registry.iter().map(|s| s.id.clone()).collect()
    }

    pub fn contains(&self, id: &SlaveId) -> bool {
        self.state.lock().registry.contains(id)
    }

    pub fn info(&self) -> BondInfo {
        let state = self.state.lock();
        BondInfo {
            name: self.name.clone(),
            mode: self.params.mode,
            carrier_up: state.carrier_up,
            slave_count: state.registry.len(),
            current_active: state.current_active.clone(),
            primary: state.primary.clone(),
            hw_addr: state.hw_addr,
            arp_candidate: state.monitor.arp_candidate().cloned(),
        }
    }

    pub fn slave_info(&self, id: &SlaveId) -> Option<SlaveInfo> {
        self.state.lock().registry.get(id).map(Slave::info)
    }

    /// Add a device to the bond.
    ///
    /// On error nothing is attached and every device change made so far is
    /// undone.
    pub fn enslave(&self, spec: SlaveSpec, now: Instant) -> Result<(), BondError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.registry.contains(&spec.id) {
            return Err(BondError::AlreadyEnslaved(spec.id));
        }

        let mode = self.params.mode;
        let driver = self.collaborators.driver.as_ref();
        let mut slave = Slave::new(spec, now, self.params.arp_shape());
        let id = slave.id.clone();

        let bond_addr = match state.hw_addr {
            Some(addr) => addr,
            None => {
                info!(bond = %self.name, slave = %id, addr = %slave.perm_hw_addr, "adopting hardware address of first slave");
                slave.perm_hw_addr
            }
        };
        let takes_bond_addr = self.params.fail_over_mac == FailOverMac::None || mode != Mode::ActiveBackup;
        if takes_bond_addr && bond_addr != slave.hw_addr {
            driver.set_hw_address(&id, bond_addr)?;
            slave.hw_addr = bond_addr;
        }

        if mode.uses_aggregator() {
            if let Err(e) = self.collaborators.aggregator.slave_attached(&id) {
                self.restore_hw_addr(&mut slave);
                return Err(e.into());
            }
        }

        if !mode.uses_primary() {
            if let Err(e) = self.apply_rx_flags(&id, 1) {
                if mode.uses_aggregator() {
                    self.collaborators.aggregator.slave_detached(&id);
                }
                self.restore_hw_addr(&mut slave);
                return Err(e.into());
            }
        }

        if state.hw_addr.is_none() {
            state.hw_addr = Some(bond_addr);
            self.collaborators.host.bond_address_changed(&self.name, bond_addr);
        }

        let carrier = driver.link_up(&id);
        let (link, delay) = state.monitor.initial_link(carrier);
        slave.link = link;
        slave.delay = delay;
        if link != LinkState::Down {
            slave.refresh_speed_duplex(driver);
        }

        if mode.uses_primary() && self.params.primary.as_deref() == Some(id.as_str()) {
            slave.is_primary = true;
            state.primary = Some(id.clone());
            state.force_primary = true;
        }

        slave.active = !mode.uses_primary();
        if mode.is_trunk() && state.current_active.is_none() && link == LinkState::Up {
            state.current_active = Some(id.clone());
        }

        state.registry.attach(slave)?;

        if mode.uses_primary() {
            self.select_active(state, now);
        }
        self.update_carrier(state);
        self.publish(state);

        let active = state.registry.get(&id).is_some_and(|s| s.active);
        info!(
            bond = %self.name,
            slave = %id,
            "enslaving as {} interface with {} link",
            if active { "an active" } else { "a backup" },
            link.name()
        );
        Ok(())
    }

    /// Remove a device from the bond and hand it back.
    pub fn release(&self, id: &SlaveId, now: Instant) -> Result<Slave, BondError> {
        let mut guard = self.state.lock();
        self.release_locked(&mut guard, id, true, now)
    }

    /// Release every slave, without reselecting in between.
    pub fn release_all(&self, now: Instant) -> Vec<Slave> {
        let mut guard = self.state.lock();
        let ids: Vec<SlaveId> = guard.registry.iter().map(|s| s.id.clone()).collect();
        let mut released = Vec::with_capacity(ids.len());
        for id in ids {
            match self.release_locked(&mut guard, &id, false, now) {
                Ok(slave) => released.push(slave),
                Err(e) => warn!(bond = %self.name, slave = %id, "release failed: {e}"),
            }
        }
        released
    }

    fn release_locked(
        &self,
        state: &mut BondState,
        id: &SlaveId,
        reselect: bool,
        now: Instant,
    ) -> Result<Slave, BondError> {
        let Some(slave) = state.registry.get(id) else {
            return Err(BondError::NotFound(id.clone()));
        };
        let mode = self.params.mode;
        info!(
            bond = %self.name,
            slave = %id,
            "releasing {} interface",
            if slave.active { "active" } else { "backup" }
        );

        if mode.uses_aggregator() {
            self.collaborators.aggregator.slave_detached(id);
        }
        state.monitor.forget(id);
        if state.primary.as_ref() == Some(id) {
            state.primary = None;
            state.force_primary = false;
        }

        let was_current = state.current_active.as_ref() == Some(id);
        if was_current {
            if let Err(e) = self.change_active(state, None, now) {
                warn!(bond = %self.name, "clearing active slave failed: {e}");
            }
            state.current_active = None;
        }

        let mut slave = state.registry.detach(id)?;

        if was_current && reselect {
            if mode.uses_primary() {
                self.select_active(state, now);
            } else {
                state.current_active = state
                    .registry
                    .iter()
                    .find(|s| s.link == LinkState::Up)
                    .map(|s| s.id.clone());
            }
        }

        if !mode.uses_primary() {
            if let Err(e) = self.apply_rx_flags(id, -1) {
                warn!(bond = %self.name, slave = %id, "failed to drop rx flags: {e}");
            }
        }
        if self.params.fail_over_mac != FailOverMac::Active || mode != Mode::ActiveBackup {
            self.restore_hw_addr(&mut slave);
        }

        if state.registry.is_empty() {
            state.hw_addr = self.params.hw_addr;
            state.peer_notify_remaining = 0;
            info!(bond = %self.name, "last slave released");
        }

        self.update_carrier(state);
        self.publish(state);
        Ok(slave)
    }

    /// Make `id` the active slave now, ahead of the reselect policy.
    ///
    /// Only for modes with a single active slave. If the hardware address
    /// move onto `id` fails the previous active slave is retained and the
    /// collaborator error is returned.
    pub fn set_active(&self, id: &SlaveId, now: Instant) -> Result<(), BondError> {
        let mode = self.params.mode;
        if !mode.uses_primary() {
            return Err(BondError::NoActiveSlave(mode));
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(slave) = state.registry.get(id) else {
            return Err(BondError::NotFound(id.clone()));
        };
        if state.current_active.as_ref() == Some(id) {
            return Ok(());
        }
        if slave.link != LinkState::Up {
            return Err(BondError::LinkNotUp(id.clone()));
        }
        info!(bond = %self.name, slave = %id, "setting active slave by request");
        let result = self.change_active(state, Some(id.clone()), now);
        self.update_carrier(state);
        self.publish(state);
        result.map_err(BondError::from)
    }

    /// Run one link monitor tick.
    pub fn monitor_tick(&self, now: Instant) -> TickOutcome {
        let Some(mut guard) = self.state.try_lock() else {
            debug!(bond = %self.name, "monitor tick skipped, lifecycle operation in progress");
            return TickOutcome::Skipped;
        };
        let state = &mut *guard;
        if state.registry.is_empty() {
            return TickOutcome::Idle;
        }

        let mut ctx = TickContext {
            now,
            mode: self.params.mode,
            current_active: state.current_active.clone(),
            primary: state.primary.clone(),
            driver: self.collaborators.driver.as_ref(),
            aggregator: self.collaborators.aggregator.as_ref(),
        };

        let inspection = state.monitor.inspect(state.registry.slaves_mut(), &ctx);
        let mut dirty = inspection.relinked;
        let mut outcome = TickOutcome::Idle;

        if inspection.needs_commit() {
            let commit = state.monitor.commit(state.registry.slaves_mut(), &ctx);
            if commit.reselect {
                if self.params.mode.uses_primary() {
                    self.select_active(state, now);
                } else {
                    self.select_trunk_active(state);
                }
            }
            dirty = true;
            outcome = TickOutcome::Committed {
                applied: commit.applied,
            };
        }

        ctx.current_active = state.current_active.clone();
        if state.monitor.probe(state.registry.slaves_mut(), &ctx) {
            dirty = true;
        }

        if dirty {
            self.update_carrier(state);
            self.publish(state);
        }
        self.notify_peers_if_due(state);
        outcome
    }

    /// Record that `slave` received any frame. Lock-free.
    pub fn frame_received(&self, slave: &SlaveId, now: Instant) {
        if self.params.monitor.arp().is_none() {
            return;
        }
        let snapshot = self.reader.load();
        if let Some((_, receive)) = snapshot.receive_view(slave) {
            receive.rx.set_last_rx(now);
        }
    }

    /// Record an ARP packet received on `slave` from `sender` for `target`.
    /// Lock-free.
    ///
    /// Only replies that pass validation refresh the ARP receive stamps.
    /// A backup slave validates the reversed pair (it sees the active slave's
    /// requests), and only once the active slave has itself heard a reply
    /// since it took over.
    pub fn arp_received(&self, slave: &SlaveId, sender: Ipv4Addr, target: Ipv4Addr, now: Instant) {
        let MonitorStrategy::Arp(params) = &self.params.monitor else {
            return;
        };
        let snapshot = self.reader.load();
        let Some((view, receive)) = snapshot.receive_view(slave) else {
            return;
        };
        let active = view.active;
        if !params.validate.applies_to(active) {
            return;
        }

        let (sip, tip) = if active {
            (sender, target)
        } else {
            let current_heard = snapshot.current_receive_view().is_some_and(|(cur, rx)| {
                slave_last_rx(params, cur.active, &rx.rx) > rx.last_link_change
            });
            if !current_heard {
                return;
            }
            (target, sender)
        };

        if sip.is_unspecified() {
            return;
        }
        if let Some(source) = params.source {
            if tip != source {
                debug!(bond = %self.name, slave = %slave, %tip, "ARP not addressed to the bond");
                return;
            }
        }
        let Some(idx) = params.targets.iter().position(|t| *t == sip) else {
            debug!(bond = %self.name, slave = %slave, %sip, "ARP from unknown target");
            return;
        };
        receive.rx.set_last_arp_rx(now);
        receive.rx.set_target_last_arp_rx(idx, now);
    }

    fn select_active(&self, state: &mut BondState, now: Instant) {
        let best = self.policy.select_best(
            state.registry.slaves(),
            state.current_active.as_ref(),
            state.primary.as_ref(),
            state.force_primary,
        );
        state.force_primary = false;
        if best == state.current_active {
            return;
        }
        if let Err(e) = self.change_active(state, best, now) {
            error!(bond = %self.name, "failover aborted: {e}");
        }
        self.update_carrier(state);
    }

    /// Keep a usable slave as the reference slave of the trunk modes
    fn select_trunk_active(&self, state: &mut BondState) {
        let still_up = state
            .current_active
            .as_ref()
            .and_then(|id| state.registry.get(id))
            .is_some_and(|s| s.link == LinkState::Up);
        if !still_up {
            state.current_active = state
                .registry
                .iter()
                .find(|s| s.link == LinkState::Up)
                .map(|s| s.id.clone());
        }
    }

    /// Make `new` the active slave.
    ///
    /// With `fail_over_mac = follow` the address move onto the new slave is
    /// done first; if the device refuses it, the old active slave is kept
    /// (or the bond is left without one if the old slave is unusable) and
    /// the error is returned.
    fn change_active(
        &self,
        state: &mut BondState,
        new: Option<SlaveId>,
        now: Instant,
    ) -> Result<(), CollaboratorError> {
        let old = state.current_active.clone();
        if old == new {
            return Ok(());
        }
        let mode = self.params.mode;

        if let (Mode::ActiveBackup, Some(new_id)) = (mode, new.as_ref()) {
            if let Err(e) = self.move_hw_addr(state, new_id, old.as_ref()) {
                let keep_old = old
                    .as_ref()
                    .and_then(|id| state.registry.get(id))
                    .is_some_and(|s| matches!(s.link, LinkState::Up | LinkState::Back));
                if !keep_old && old.is_some() {
                    self.change_active(state, None, now)?;
                }
                return Err(e);
            }
        }

        if let Some(new_id) = new.as_ref() {
            if let Some(slave) = state.registry.get_mut(new_id) {
                slave.last_link_change = now;
                if slave.link == LinkState::Back {
                    slave.link = LinkState::Up;
                    slave.delay = 0;
                    if mode.uses_primary() {
                        info!(bond = %self.name, slave = %new_id, "making interface the new active one before its up delay expired");
                    }
                    if mode.uses_aggregator() {
                        self.collaborators.aggregator.link_changed(new_id, LinkEvent::Up);
                    }
                } else if mode.uses_primary() {
                    info!(bond = %self.name, slave = %new_id, "making interface the new active one");
                }
            }
        }

        if mode.is_tlb_alb() {
            self.collaborators.aggregator.active_changed(new.as_ref());
        }
        if mode.uses_primary() {
            self.swap_rx_flags(old.as_ref(), new.as_ref());
        }

        state.current_active = new.clone();

        if mode.uses_primary() {
            if let Some(s) = old.as_ref().and_then(|id| state.registry.get_mut(id)) {
                s.active = false;
            }
            if let Some(s) = new.as_ref().and_then(|id| state.registry.get_mut(id)) {
                s.active = true;
            }
        }

        if mode == Mode::ActiveBackup {
            if let Some(new_id) = new.as_ref() {
                state.peer_notify_remaining = self.params.num_peer_notif;
                self.collaborators.host.failover(&self.name, new_id);
                self.notify_peers_if_due(state);
            }
        }
        Ok(())
    }

    /// Hardware address handling for an active-backup failover
    fn move_hw_addr(
        &self,
        state: &mut BondState,
        new: &SlaveId,
        old: Option<&SlaveId>,
    ) -> Result<(), CollaboratorError> {
        let Some(new_addr) = state.registry.get(new).map(|s| s.hw_addr) else {
            return Ok(());
        };
        match self.params.fail_over_mac {
            FailOverMac::None => Ok(()),
            FailOverMac::Active => {
                if state.hw_addr != Some(new_addr) {
                    state.hw_addr = Some(new_addr);
                    self.collaborators.host.bond_address_changed(&self.name, new_addr);
                }
                Ok(())
            }
            FailOverMac::Follow => {
                let old_addr = old.and_then(|id| state.registry.get(id)).map(|s| s.hw_addr);
                let Some(target) = old_addr.or(state.hw_addr) else {
                    return Ok(());
                };
                if target == new_addr {
                    return Ok(());
                }
                let driver = self.collaborators.driver.as_ref();
                driver.set_hw_address(new, target)?;
                if let Some(s) = state.registry.get_mut(new) {
                    s.hw_addr = target;
                }
                if let Some(old_id) = old.filter(|_| old_addr.is_some()) {
                    match driver.set_hw_address(old_id, new_addr) {
                        Ok(()) => {
                            if let Some(s) = state.registry.get_mut(old_id) {
                                s.hw_addr = new_addr;
                            }
                        }
                        Err(e) => warn!(bond = %self.name, slave = %old_id, "failed to hand over address: {e}"),
                    }
                }
                Ok(())
            }
        }
    }

    fn apply_rx_flags(&self, id: &SlaveId, delta: i32) -> Result<(), CollaboratorError> {
        let driver = self.collaborators.driver.as_ref();
        if self.params.promiscuous {
            driver.set_promiscuity(id, delta)?;
        }
        if self.params.all_multicast {
            if let Err(e) = driver.set_allmulti(id, delta) {
                if self.params.promiscuous {
                    if let Err(undo) = driver.set_promiscuity(id, -delta) {
                        warn!(bond = %self.name, slave = %id, "failed to roll back promiscuity: {undo}");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn swap_rx_flags(&self, old: Option<&SlaveId>, new: Option<&SlaveId>) {
        if let Some(old) = old {
            if let Err(e) = self.apply_rx_flags(old, -1) {
                warn!(bond = %self.name, slave = %old, "failed to drop rx flags: {e}");
            }
        }
        if let Some(new) = new {
            if let Err(e) = self.apply_rx_flags(new, 1) {
                warn!(bond = %self.name, slave = %new, "failed to set rx flags: {e}");
            }
        }
    }

    fn restore_hw_addr(&self, slave: &mut Slave) {
        if slave.hw_addr == slave.perm_hw_addr {
            return;
        }
        match self
            .collaborators
            .driver
            .set_hw_address(&slave.id, slave.perm_hw_addr)
        {
            Ok(()) => slave.hw_addr = slave.perm_hw_addr,
            Err(e) => {
                warn!(bond = %self.name, slave = %slave.id, "failed to restore permanent address: {e}")
            }
        }
    }

    fn notify_peers_if_due(&self, state: &mut BondState) {
        if state.peer_notify_remaining == 0 || state.current_active.is_none() {
            return;
        }
        state.peer_notify_remaining -= 1;
        self.collaborators.host.notify_peers(&self.name);
    }

    /// Recompute bond carrier; returns whether it changed.
    ///
    /// A slave still in its down delay keeps the carrier up.
    fn update_carrier(&self, state: &mut BondState) -> bool {
        let any_up = || {
            state
                .registry
                .iter()
                .any(|s| matches!(s.link, LinkState::Up | LinkState::Fail))
        };
        let up = if state.registry.is_empty() {
            false
        } else if self.params.mode == Mode::Lacp {
            self.collaborators.aggregator.carrier().unwrap_or_else(any_up)
        } else {
            any_up()
        };
        if up == state.carrier_up {
            return false;
        }
        state.carrier_up = up;
        if up {
            info!(bond = %self.name, "first active interface up!");
        } else {
            warn!(bond = %self.name, "now running without any active interface!");
        }
        self.collaborators.host.carrier_changed(&self.name, up);
        true
    }

    fn publish(&self, state: &mut BondState) {
        state.registry.publish(state.current_active.as_ref());
    }
}
