//! Transmit distribution.
//!
//! Decides which slave(s) carry each outgoing frame. The distributor only
//! reads a published [`RegistrySnapshot`] and an atomic round-robin counter,
//! so any number of transmitters can call it concurrently with monitor
//! ticks and lifecycle operations.
//!
//! - **balance-rr**: rotate over live slaves, `packets_per_slave` frames each
//! - **active-backup**: the current active slave only
//! - **balance-xor**: header hash modulo live slave count
//! - **broadcast**: every transmit-capable slave
//! - **802.3ad / TLB / ALB**: delegated to the aggregator

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{BondParams, Mode, PacketsPerSlave, XmitHashPolicy};
use crate::device::Aggregator;
use crate::frame::Frame;
use crate::registry::RegistrySnapshot;
use crate::slave::{LinkState, SlaveId};

/// Precomputed reciprocal for dividing by a constant without a divide.
///
/// Exact for every 64-bit dividend: with `t = (a * m) >> 64` the quotient is
/// `(t + ((a - t) >> sh1)) >> sh2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reciprocal {
    m: u64,
    sh1: u32,
    sh2: u32,
}

impl Reciprocal {
    /// A zero divisor is treated as one.
    pub fn new(divisor: u32) -> Self {
        let d = u128::from(divisor.max(1));
        // ceil(log2 d)
        let l = u128::BITS - (d - 1).leading_zeros();
        let m = ((1u128 << 64) * ((1u128 << l) - d)) / d + 1;
        Self {
            m: m as u64,
            sh1: l.min(1),
            sh2: l.saturating_sub(1),
        }
    }

    /// `a / divisor` for the divisor this was built from
    pub fn divide(&self, a: u64) -> u64 {
        let t = ((u128::from(a) * u128::from(self.m)) >> 64) as u64;
        (t + ((a - t) >> self.sh1)) >> self.sh2
    }
}

/// Hash a frame's headers into `0..count` according to `policy`.
///
/// Frames that cannot be dissected at the requested layer fall back to the
/// layer-2 hash.
pub fn xmit_hash(frame: &Frame<'_>, policy: XmitHashPolicy, count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    let l2 = frame.l2_hash();
    if policy == XmitHashPolicy::Layer2 {
        return l2 as usize % count;
    }
    let Ok(flow) = frame.flow_keys(policy == XmitHashPolicy::Layer34) else {
        return l2 as usize % count;
    };
    let mut hash = match policy {
        XmitHashPolicy::Layer23 => l2,
        _ => flow.ports,
    };
    hash ^= flow.dst ^ flow.src;
    hash ^= hash >> 16;
    hash ^= hash >> 8;
    hash as usize % count
}

/// Where a frame goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxDecision {
    /// Slave that receives the original frame
    pub slave: SlaveId,
    /// Slaves that receive a copy (broadcast only)
    pub clones: Vec<SlaveId>,
}

impl TxDecision {
    fn single(slave: SlaveId) -> Self {
        Self {
            slave,
            clones: Vec::new(),
        }
    }

    /// Every slave the frame is sent on, copies first
    pub fn targets(&self) -> impl Iterator<Item = &SlaveId> {
        self.clones.iter().chain(std::iter::once(&self.slave))
    }

    pub fn fanout(&self) -> usize {
        self.clones.len() + 1
    }
}

/// Per-bond transmit slave selection
#[derive(Debug)]
pub struct TransmitDistributor {
    mode: Mode,
    hash_policy: XmitHashPolicy,
    packets_per_slave: PacketsPerSlave,
    rr_tx_counter: AtomicU64,
}

impl TransmitDistributor {
    pub fn new(params: &BondParams) -> Self {
        Self {
            mode: params.mode,
            hash_policy: params.xmit_hash_policy,
            packets_per_slave: params.packets_per_slave,
            rr_tx_counter: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Choose the slave(s) for `frame`, or `None` to drop it.
    pub fn select(
        &self,
        frame: &Frame<'_>,
        snapshot: &RegistrySnapshot,
        aggregator: &dyn Aggregator,
    ) -> Option<TxDecision> {
        if snapshot.is_empty() {
            return None;
        }

        if self.mode != Mode::Broadcast {
            if let Some(slave) = self.queue_override(frame, snapshot) {
                return Some(TxDecision::single(slave));
            }
        }

        match self.mode {
            Mode::RoundRobin => self.select_round_robin(frame, snapshot),
            Mode::ActiveBackup => snapshot
                .current_active()
                .map(|s| TxDecision::single(s.id.clone())),
            Mode::Xor => {
                let live = live_slaves(snapshot);
                let idx = xmit_hash(frame, self.hash_policy, live.len());
                live.get(idx).map(|id| TxDecision::single((*id).clone()))
            }
            Mode::Broadcast => select_broadcast(snapshot),
            Mode::Lacp | Mode::Tlb | Mode::Alb => aggregator
                .select_tx(frame, snapshot, self.hash_policy)
                .map(TxDecision::single),
        }
    }

    /// Slave pinned by the frame's queue hint, if its link is up
    fn queue_override(&self, frame: &Frame<'_>, snapshot: &RegistrySnapshot) -> Option<SlaveId> {
        let queue = frame.queue_mapping();
        if queue == 0 {
            return None;
        }
        let slave = snapshot.iter().find(|s| s.queue_id == queue)?;
        (slave.link == LinkState::Up).then(|| slave.id.clone())
    }

    fn next_rr_slave_id(&self) -> u64 {
        let counter = self.rr_tx_counter.fetch_add(1, Ordering::Relaxed);
        match self.packets_per_slave {
            PacketsPerSlave::Random => rand::random(),
            PacketsPerSlave::Each => counter,
            PacketsPerSlave::Batch { reciprocal, .. } => reciprocal.divide(counter),
        }
    }

    fn select_round_robin(&self, frame: &Frame<'_>, snapshot: &RegistrySnapshot) -> Option<TxDecision> {
        if frame.is_igmp() {
            if let Some(active) = snapshot.current_active().filter(|s| s.can_transmit()) {
                return Some(TxDecision::single(active.id.clone()));
            }
        }
        let live = live_slaves(snapshot);
        if live.is_empty() {
            return None;
        }
        if frame.is_igmp() {
            return Some(TxDecision::single(live[0].clone()));
        }
        let idx = (self.next_rr_slave_id() % live.len() as u64) as usize;
        Some(TxDecision::single(live[idx].clone()))
    }
}

/// Transmit-capable slaves in registry order
fn live_slaves(snapshot: &RegistrySnapshot) -> Vec<&SlaveId> {
    snapshot
        .iter()
        .filter(|s| s.can_transmit())
        .map(|s| &s.id)
        .collect()
}

fn select_broadcast(snapshot: &RegistrySnapshot) -> Option<TxDecision> {
    let (last, rest) = snapshot.slaves().split_last()?;
    let mut clones: Vec<SlaveId> = rest
        .iter()
        .filter(|s| s.can_transmit())
        .map(|s| s.id.clone())
        .collect();
    if last.can_transmit() {
        return Some(TxDecision {
            slave: last.id.clone(),
            clones,
        });
    }
    // last slave is down, hand the original to the last usable copy
    let slave = clones.pop()?;
    Some(TxDecision { slave, clones })
}
