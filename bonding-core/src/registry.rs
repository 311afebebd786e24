//! Ordered slave registry with lock-free snapshots for the transmit path.
//!
//! The registry itself is owned by the bond's writer side. Readers only ever
//! see [`RegistrySnapshot`]s, published whole through an `ArcSwap` once a
//! mutation is complete, so a transmitter observes each enslave, release or
//! failover either fully before or fully after it happened.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::slave::{LinkState, RxStamps, Slave, SlaveId};

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("{0} is already enslaved")]
    AlreadyEnslaved(SlaveId),

    #[error("{0} is not enslaved")]
    NotFound(SlaveId),
}

/// What the transmit path needs to know about one slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveView {
    pub id: SlaveId,
    pub link: LinkState,
    pub active: bool,
    pub queue_id: u16,
}

impl SlaveView {
    pub fn can_transmit(&self) -> bool {
        self.link == LinkState::Up && self.active
    }
}

impl From<&Slave> for SlaveView {
    fn from(slave: &Slave) -> Self {
        Self {
            id: slave.id.clone(),
            link: slave.link,
            active: slave.active,
            queue_id: slave.queue_id,
        }
    }
}

/// Receive-path handle on one slave
#[derive(Debug, Clone)]
pub(crate) struct ReceiveView {
    pub(crate) rx: Arc<RxStamps>,
    pub(crate) last_link_change: Instant,
}

impl From<&Slave> for ReceiveView {
    fn from(slave: &Slave) -> Self {
        Self {
            rx: Arc::clone(&slave.rx),
            last_link_change: slave.last_link_change,
        }
    }
}

/// Immutable, consistent view of the registry
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    slaves: Vec<SlaveView>,
    /// Parallel to `slaves`
    receive: Vec<ReceiveView>,
    current_active: Option<usize>,
    version: u64,
}

impl RegistrySnapshot {
    /// Slaves in insertion order
    pub fn iter(&self) -> std::slice::Iter<'_, SlaveView> {
        self.slaves.iter()
    }

    pub fn slaves(&self) -> &[SlaveView] {
        &self.slaves
    }

    pub fn len(&self) -> usize {
        self.slaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slaves.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SlaveView> {
        self.slaves.get(index)
    }

    pub fn find(&self, id: &SlaveId) -> Option<&SlaveView> {
        self.slaves.iter().find(|s| &s.id == id)
    }

    pub fn current_active(&self) -> Option<&SlaveView> {
        self.current_active.and_then(|i| self.slaves.get(i))
    }

    pub(crate) fn receive_view(&self, id: &SlaveId) -> Option<(&SlaveView, &ReceiveView)> {
        let pos = self.slaves.iter().position(|s| &s.id == id)?;
        self.view_at(pos)
    }

    pub(crate) fn current_receive_view(&self) -> Option<(&SlaveView, &ReceiveView)> {
        self.view_at(self.current_active?)
    }

    fn view_at(&self, pos: usize) -> Option<(&SlaveView, &ReceiveView)> {
        Some((self.slaves.get(pos)?, self.receive.get(pos)?))
    }

    /// Monotonic publication counter
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Read handle on the published snapshot
#[derive(Debug, Clone)]
pub struct SnapshotReader(Arc<ArcSwap<RegistrySnapshot>>);

impl SnapshotReader {
    pub fn load(&self) -> Arc<RegistrySnapshot> {
        self.0.load_full()
    }
}

/// Insertion-ordered set of slaves keyed by [`SlaveId`]
#[derive(Debug)]
pub struct SlaveRegistry {
    slaves: Vec<Slave>,
    index: HashMap<SlaveId, usize>,
    published: Arc<ArcSwap<RegistrySnapshot>>,
    version: u64,
}

impl Default for SlaveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SlaveRegistry {
    pub fn new() -> Self {
        Self {
            slaves: Vec::new(),
            index: HashMap::new(),
            published: Arc::new(ArcSwap::from_pointee(RegistrySnapshot::default())),
            version: 0,
        }
    }

    /// Append a slave. Not visible to readers until [`Self::publish`].
    pub fn attach(&mut self, slave: Slave) -> Result<(), RegistryError> {
        if self.index.contains_key(&slave.id) {
            return Err(RegistryError::AlreadyEnslaved(slave.id.clone()));
        }
        self.index.insert(slave.id.clone(), self.slaves.len());
        self.slaves.push(slave);
        Ok(())
    }

    /// Remove a slave, preserving the order of the rest.
    pub fn detach(&mut self, id: &SlaveId) -> Result<Slave, RegistryError> {
        let pos = self
            .index
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        let slave = self.slaves.remove(pos);
        for (i, s) in self.slaves.iter().enumerate().skip(pos) {
            self.index.insert(s.id.clone(), i);
        }
        Ok(slave)
    }

    pub fn contains(&self, id: &SlaveId) -> bool {
        self.index.contains_key(id)
    }

    pub fn position(&self, id: &SlaveId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn get(&self, id: &SlaveId) -> Option<&Slave> {
        self.position(id).and_then(|i| self.slaves.get(i))
    }

    pub fn get_mut(&mut self, id: &SlaveId) -> Option<&mut Slave> {
        let pos = self.position(id)?;
        self.slaves.get_mut(pos)
    }

    pub fn slaves(&self) -> &[Slave] {
        &self.slaves
    }

    pub fn slaves_mut(&mut self) -> &mut [Slave] {
        &mut self.slaves
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Slave> {
        self.slaves.iter()
    }

    pub fn len(&self) -> usize {
        self.slaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slaves.is_empty()
    }

    pub fn first(&self) -> Option<&Slave> {
        self.slaves.first()
    }

    pub fn last(&self) -> Option<&Slave> {
        self.slaves.last()
    }

    /// Publish the current contents for readers.
    pub fn publish(&mut self, current_active: Option<&SlaveId>) {
        self.version = self.version.wrapping_add(1);
        let snapshot = RegistrySnapshot {
            slaves: self.slaves.iter().map(SlaveView::from).collect(),
            receive: self.slaves.iter().map(ReceiveView::from).collect(),
            current_active: current_active.and_then(|id| self.position(id)),
            version: self.version,
        };
        self.published.store(Arc::new(snapshot));
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.published.load_full()
    }

    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader(Arc::clone(&self.published))
    }
}
