//! Registry of named bonds.
//!
//! A device may belong to at most one bond; [`BondRegistry::enslave`] checks
//! that across all bonds before delegating to [`Bond::enslave`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::bond::{Bond, BondError};
use crate::config::BondConfig;
use crate::device::Collaborators;
use crate::runtime::{spawn_monitor, MonitorHandle};
use crate::slave::{Slave, SlaveId, SlaveSpec};

struct BondEntry {
    bond: Arc<Bond>,
    monitor: Option<MonitorHandle>,
}

/// All bonds of a host, by name
#[derive(Default)]
pub struct BondRegistry {
    bonds: Mutex<HashMap<String, BondEntry>>,
}

impl BondRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bond. Monitoring is not started.
    pub fn create(
        &self,
        name: &str,
        config: &BondConfig,
        collaborators: Collaborators,
    ) -> Result<Arc<Bond>, BondError> {
        let mut bonds = self.bonds.lock();
        if bonds.contains_key(name) {
            return Err(BondError::BondExists(name.to_string()));
        }
        let bond = Arc::new(Bond::new(name, config, collaborators)?);
        bonds.insert(
            name.to_string(),
            BondEntry {
                bond: Arc::clone(&bond),
                monitor: None,
            },
        );
        Ok(bond)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Bond>> {
        self.bonds.lock().get(name).map(|e| Arc::clone(&e.bond))
    }

    /// Bond names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bonds.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Name of the bond `slave` belongs to
    pub fn owner_of(&self, slave: &SlaveId) -> Option<String> {
        self.bonds
            .lock()
            .iter()
            .find(|(_, e)| e.bond.contains(slave))
            .map(|(name, _)| name.clone())
    }

    /// Enslave a device into the named bond.
    pub fn enslave(&self, bond: &str, spec: SlaveSpec, now: Instant) -> Result<(), BondError> {
        let bonds = self.bonds.lock();
        let Some(entry) = bonds.get(bond) else {
            return Err(BondError::UnknownBond(bond.to_string()));
        };
        if bonds.values().any(|e| e.bond.contains(&spec.id)) {
            return Err(BondError::AlreadyEnslaved(spec.id));
        }
        entry.bond.enslave(spec, now)
    }

    /// Start the link monitor of the named bond. Idempotent.
    pub fn start_monitor(&self, bond: &str) -> Result<(), BondError> {
        let mut bonds = self.bonds.lock();
        let Some(entry) = bonds.get_mut(bond) else {
            return Err(BondError::UnknownBond(bond.to_string()));
        };
        if entry.monitor.is_none() {
            entry.monitor = Some(spawn_monitor(Arc::clone(&entry.bond)));
        }
        Ok(())
    }

    /// Remove the named bond, stop its monitor and release its slaves.
    pub async fn destroy(&self, bond: &str) -> Result<Vec<Slave>, BondError> {
        let entry = self
            .bonds
            .lock()
            .remove(bond)
            .ok_or_else(|| BondError::UnknownBond(bond.to_string()))?;
        let released = match entry.monitor {
            Some(monitor) => monitor.shutdown().await,
            None => entry.bond.release_all(tokio::time::Instant::now().into_std()),
        };
        info!(bond, "bond destroyed");
        Ok(released)
    }
}
