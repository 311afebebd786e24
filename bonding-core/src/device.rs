//! External collaborators driven by the bonding core.
//!
//! The core never touches hardware or the host network stack directly. Every
//! side effect goes through one of three traits, implemented as thin adapters
//! by whatever embeds the core:
//!
//! - [`LinkDriver`]: per-slave device operations (link query, probes, MAC, rx flags)
//! - [`HostStack`]: bond-level notifications (carrier edges, peer announcements)
//! - [`Aggregator`]: mode-specific bookkeeping for 802.3ad and TLB/ALB
//!
//! Adapters are called with the bond's writer lock held and must not call
//! back into [`crate::Bond`] lifecycle operations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use crate::config::XmitHashPolicy;
use crate::frame::Frame;
use crate::registry::RegistrySnapshot;
use crate::slave::SlaveId;
use crate::xmit::xmit_hash;

/// Errors reported by collaborator adapters
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("device {device} rejected {operation}: {reason}")]
    Rejected {
        device: SlaveId,
        operation: &'static str,
        reason: String,
    },

    #[error("device {0} is not available")]
    Unavailable(SlaveId),
}

/// Ethernet hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Create an address from its six octets
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Raw octets
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// Error returned when parsing a textual MAC address
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address: {0:?}")]
pub struct ParseMacError(String);

impl FromStr for MacAddr {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(|| ParseMacError(s.to_string()))?;
            if part.len() != 2 {
                return Err(ParseMacError(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError(s.to_string()));
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = ParseMacError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(addr: MacAddr) -> Self {
        addr.to_string()
    }
}

/// Link duplex as reported by the device driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Duplex {
    Half,
    Full,
}

impl fmt::Display for Duplex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Duplex::Half => write!(f, "half"),
            Duplex::Full => write!(f, "full"),
        }
    }
}

/// Committed link transition, as seen by the aggregator hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkEvent {
    Up,
    Down,
}

/// Per-slave device operations
pub trait LinkDriver: Send + Sync {
    /// Whether the device currently reports carrier.
    ///
    /// Must not block: it is called from the inspection phase of every
    /// monitor tick.
    fn link_up(&self, slave: &SlaveId) -> bool;

    /// Speed in Mbps and duplex, `None` when the driver cannot tell
    fn speed_duplex(&self, _slave: &SlaveId) -> Option<(u32, Duplex)> {
        None
    }

    /// Last time the device transmitted anything, if the driver tracks it
    fn last_tx(&self, _slave: &SlaveId) -> Option<Instant> {
        None
    }

    /// Fire an ARP request for `target` out of `slave`
    fn send_probe(&self, slave: &SlaveId, target: Ipv4Addr) -> Result<(), CollaboratorError>;

    /// Program the device's hardware address
    fn set_hw_address(&self, slave: &SlaveId, addr: MacAddr) -> Result<(), CollaboratorError>;

    /// Adjust the device's promiscuity reference count
    fn set_promiscuity(&self, slave: &SlaveId, delta: i32) -> Result<(), CollaboratorError>;

    /// Adjust the device's all-multicast reference count
    fn set_allmulti(&self, slave: &SlaveId, delta: i32) -> Result<(), CollaboratorError>;
}

/// Bond-level notifications to the host network stack
pub trait HostStack: Send + Sync {
    /// Edge-triggered carrier change of the bond itself
    fn carrier_changed(&self, bond: &str, up: bool);

    /// Send a gratuitous announcement (ARP / unsolicited NA) for the bond
    fn notify_peers(&self, bond: &str);

    /// A new active slave was committed in active-backup mode
    fn failover(&self, _bond: &str, _active: &SlaveId) {}

    /// The bond's own hardware address changed
    fn bond_address_changed(&self, _bond: &str, _addr: MacAddr) {}
}

/// Mode-specific hooks for 802.3ad and TLB/ALB.
///
/// The core treats every hook as fire-and-forget except
/// [`Aggregator::slave_attached`], whose failure aborts the enslave.
pub trait Aggregator: Send + Sync {
    /// A slave is joining the bond
    fn slave_attached(&self, _slave: &SlaveId) -> Result<(), CollaboratorError> {
        Ok(())
    }

    /// A slave is leaving the bond
    fn slave_detached(&self, _slave: &SlaveId) {}

    /// A committed link transition on `slave`
    fn link_changed(&self, _slave: &SlaveId, _event: LinkEvent) {}

    /// The active slave changed (TLB/ALB)
    fn active_changed(&self, _active: Option<&SlaveId>) {}

    /// Carrier as judged by the aggregator, `None` to derive it from slave links
    fn carrier(&self) -> Option<bool> {
        None
    }

    /// Pick the transmit slave for `frame`.
    ///
    /// The default hashes over the transmit-capable slaves in registry order.
    fn select_tx(
        &self,
        frame: &Frame<'_>,
        snapshot: &RegistrySnapshot,
        policy: XmitHashPolicy,
    ) -> Option<SlaveId> {
        let usable: Vec<&SlaveId> = snapshot
            .iter()
            .filter(|s| s.can_transmit())
            .map(|s| &s.id)
            .collect();
        if usable.is_empty() {
            return None;
        }
        let idx = xmit_hash(frame, policy, usable.len());
        usable.get(idx).map(|id| (*id).clone())
    }
}

/// Aggregator used when the embedder does not supply one
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAggregator;

impl Aggregator for NoAggregator {}

/// The set of adapters a bond drives
#[derive(Clone)]
pub struct Collaborators {
    pub driver: Arc<dyn LinkDriver>,
    pub host: Arc<dyn HostStack>,
    pub aggregator: Arc<dyn Aggregator>,
}

impl Collaborators {
    /// Bundle a driver and host stack, with no aggregator
    pub fn new(driver: Arc<dyn LinkDriver>, host: Arc<dyn HostStack>) -> Self {
        Self {
            driver,
            host,
            aggregator: Arc::new(NoAggregator),
        }
    }

    /// Replace the aggregator hooks
    pub fn with_aggregator(mut self, aggregator: Arc<dyn Aggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_display_and_parse() {
        let mac = MacAddr::new([0x02, 0x00, 0x5e, 0x10, 0xab, 0xff]);
        assert_eq!(mac.to_string(), "02:00:5e:10:ab:ff");
        assert_eq!("02:00:5e:10:ab:ff".parse::<MacAddr>().unwrap(), mac);
    }

    #[test]
    fn test_mac_parse_rejects_garbage() {
        assert!("02:00:5e:10:ab".parse::<MacAddr>().is_err());
        assert!("02:00:5e:10:ab:ff:01".parse::<MacAddr>().is_err());
        assert!("zz:00:5e:10:ab:ff".parse::<MacAddr>().is_err());
        assert!("2:00:5e:10:ab:ff".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_duplex_ordering() {
        assert!(Duplex::Half < Duplex::Full);
    }
}
