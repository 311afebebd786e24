//! Active slave selection for active-backup, TLB and ALB.

use crate::config::ReselectPolicy;
use crate::device::Duplex;
use crate::slave::{LinkState, Slave, SlaveId};

/// Chooses the slave that should carry traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverPolicy {
    reselect: ReselectPolicy,
}

impl FailoverPolicy {
    pub fn new(reselect: ReselectPolicy) -> Self {
        Self { reselect }
    }

    pub fn reselect(&self) -> ReselectPolicy {
        self.reselect
    }

    /// Whether an up primary may take over from `current`.
    ///
    /// `force_primary` is set right after the primary is (re)enslaved and
    /// overrides the reselect policy once.
    pub fn should_change_active(
        &self,
        primary: &Slave,
        current: Option<&Slave>,
        force_primary: bool,
    ) -> bool {
        let Some(current) = current else {
            return true;
        };
        if current.link != LinkState::Up || force_primary {
            return true;
        }
        match self.reselect {
            ReselectPolicy::Always => true,
            ReselectPolicy::BetterSpeedDuplex => {
                let (p_speed, c_speed) = (primary.speed.unwrap_or(0), current.speed.unwrap_or(0));
                let p_duplex = primary.duplex.unwrap_or(Duplex::Half);
                let c_duplex = current.duplex.unwrap_or(Duplex::Half);
                !(p_speed < c_speed || (p_speed == c_speed && p_duplex <= c_duplex))
            }
            ReselectPolicy::OnFailureOnly => false,
        }
    }

    /// Pick the best slave, or `None` when nothing is usable.
    ///
    /// In order of preference: an up primary the policy allows to preempt,
    /// the current active slave if still up, the first up slave in registry
    /// order, then the `Back` slave closest to finishing its up delay (ties
    /// broken by registry order).
    pub fn select_best(
        &self,
        slaves: &[Slave],
        current: Option<&SlaveId>,
        primary: Option<&SlaveId>,
        force_primary: bool,
    ) -> Option<SlaveId> {
        let find = |id: &SlaveId| slaves.iter().find(|s| &s.id == id);
        let current = current.and_then(find);

        if let Some(primary) = primary.and_then(find) {
            if primary.link == LinkState::Up
                && self.should_change_active(primary, current, force_primary)
            {
                return Some(primary.id.clone());
            }
        }

        if let Some(current) = current {
            if current.link == LinkState::Up {
                return Some(current.id.clone());
            }
        }

        if let Some(up) = slaves.iter().find(|s| s.link == LinkState::Up) {
            return Some(up.id.clone());
        }

        // min_by_key keeps the first of equal keys
        slaves
            .iter()
            .filter(|s| s.link == LinkState::Back)
            .min_by_key(|s| s.delay)
            .map(|s| s.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MacAddr;
    use crate::slave::SlaveSpec;
    use std::time::Instant;

    fn slave(name: &str, link: LinkState) -> Slave {
        let mut s = Slave::new(SlaveSpec::new(name, MacAddr::default()), Instant::now(), None);
        s.link = link;
        s
    }

    fn id(name: &str) -> SlaveId {
        SlaveId::new(name)
    }

    #[test]
    fn test_first_up_slave_in_order() {
        let slaves = vec![
            slave("eth0", LinkState::Down),
            slave("eth1", LinkState::Up),
            slave("eth2", LinkState::Up),
        ];
        let policy = FailoverPolicy::new(ReselectPolicy::Always);
        assert_eq!(policy.select_best(&slaves, None, None, false), Some(id("eth1")));
    }

    #[test]
    fn test_current_kept_while_up() {
        let slaves = vec![slave("eth0", LinkState::Up), slave("eth1", LinkState::Up)];
        let policy = FailoverPolicy::new(ReselectPolicy::Always);
        assert_eq!(
            policy.select_best(&slaves, Some(&id("eth1")), None, false),
            Some(id("eth1"))
        );
    }

    #[test]
    fn test_primary_preempts_under_always() {
        let slaves = vec![slave("eth0", LinkState::Up), slave("eth1", LinkState::Up)];
        let policy = FailoverPolicy::new(ReselectPolicy::Always);
        assert_eq!(
            policy.select_best(&slaves, Some(&id("eth1")), Some(&id("eth0")), false),
            Some(id("eth0"))
        );
    }

    #[test]
    fn test_on_failure_only_keeps_current() {
        let slaves = vec![slave("eth0", LinkState::Up), slave("eth1", LinkState::Up)];
        let policy = FailoverPolicy::new(ReselectPolicy::OnFailureOnly);
        assert_eq!(
            policy.select_best(&slaves, Some(&id("eth1")), Some(&id("eth0")), false),
            Some(id("eth1"))
        );
        // forced once after enslave
        assert_eq!(
            policy.select_best(&slaves, Some(&id("eth1")), Some(&id("eth0")), true),
            Some(id("eth0"))
        );
    }

    #[test]
    fn test_better_speed_duplex() {
        let mut primary = slave("eth0", LinkState::Up);
        let mut current = slave("eth1", LinkState::Up);
        let policy = FailoverPolicy::new(ReselectPolicy::BetterSpeedDuplex);

        primary.speed = Some(1000);
        primary.duplex = Some(Duplex::Full);
        current.speed = Some(1000);
        current.duplex = Some(Duplex::Full);
        assert!(!policy.should_change_active(&primary, Some(&current), false));

        current.duplex = Some(Duplex::Half);
        assert!(policy.should_change_active(&primary, Some(&current), false));

        current.speed = Some(10_000);
        assert!(!policy.should_change_active(&primary, Some(&current), false));

        primary.speed = Some(25_000);
        assert!(policy.should_change_active(&primary, Some(&current), false));
    }

    #[test]
    fn test_down_current_always_yields() {
        let primary = slave("eth0", LinkState::Up);
        let current = slave("eth1", LinkState::Fail);
        let policy = FailoverPolicy::new(ReselectPolicy::OnFailureOnly);
        assert!(policy.should_change_active(&primary, Some(&current), false));
        assert!(policy.should_change_active(&primary, None, false));
    }

    #[test]
    fn test_back_slave_with_smallest_delay() {
        let mut a = slave("eth0", LinkState::Back);
        let mut b = slave("eth1", LinkState::Back);
        let mut c = slave("eth2", LinkState::Back);
        a.delay = 3;
        b.delay = 1;
        c.delay = 1;
        let slaves = vec![a, b, c, slave("eth3", LinkState::Down)];
        let policy = FailoverPolicy::new(ReselectPolicy::Always);
        assert_eq!(policy.select_best(&slaves, None, None, false), Some(id("eth1")));
    }

    #[test]
    fn test_nothing_usable() {
        let slaves = vec![slave("eth0", LinkState::Down), slave("eth1", LinkState::Fail)];
        let policy = FailoverPolicy::new(ReselectPolicy::Always);
        assert_eq!(policy.select_best(&slaves, Some(&id("eth0")), None, false), None);
        assert_eq!(policy.select_best(&[], None, None, false), None);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let slaves = vec![
            slave("eth0", LinkState::Down),
            slave("eth1", LinkState::Up),
            slave("eth2", LinkState::Up),
        ];
        let policy = FailoverPolicy::new(ReselectPolicy::Always);
        let first = policy.select_best(&slaves, None, None, false);
        for _ in 0..10 {
            assert_eq!(policy.select_best(&slaves, None, None, false), first);
        }
    }
}
