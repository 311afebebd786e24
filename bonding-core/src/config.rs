//! Bond configuration.
//!
//! [`BondConfig`] is the user-facing, serde-friendly shape (TOML on disk).
//! [`BondConfig::validate`] turns it into [`BondParams`], the checked form the
//! controller runs on. All cross-field rules live in `validate`; nothing
//! downstream re-checks them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::device::MacAddr;
use crate::xmit::Reciprocal;

/// Link monitor interval used when neither MII nor ARP monitoring is configured
pub const DEFAULT_MIIMON: Duration = Duration::from_millis(100);

/// Maximum number of ARP probe targets per bond
pub const MAX_ARP_TARGETS: usize = 16;

/// Upper bound for `packets_per_slave`
pub const MAX_PACKETS_PER_SLAVE: u32 = u16::MAX as u32;

/// Bonding mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    #[serde(rename = "balance-rr")]
    RoundRobin,
    #[serde(rename = "active-backup")]
    ActiveBackup,
    #[serde(rename = "balance-xor")]
    Xor,
    #[serde(rename = "broadcast")]
    Broadcast,
    #[serde(rename = "802.3ad")]
    Lacp,
    #[serde(rename = "balance-tlb")]
    Tlb,
    #[serde(rename = "balance-alb")]
    Alb,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::RoundRobin => "load balancing (round-robin)",
            Mode::ActiveBackup => "fault-tolerance (active-backup)",
            Mode::Xor => "load balancing (xor)",
            Mode::Broadcast => "fault-tolerance (broadcast)",
            Mode::Lacp => "IEEE 802.3ad Dynamic link aggregation",
            Mode::Tlb => "transmit load balancing",
            Mode::Alb => "adaptive load balancing",
        }
    }

    /// Modes with a single active slave chosen by failover
    pub fn uses_primary(&self) -> bool {
        matches!(self, Mode::ActiveBackup | Mode::Tlb | Mode::Alb)
    }

    /// Modes that delegate bookkeeping to an [`crate::Aggregator`]
    pub fn uses_aggregator(&self) -> bool {
        matches!(self, Mode::Lacp | Mode::Tlb | Mode::Alb)
    }

    pub fn is_tlb_alb(&self) -> bool {
        matches!(self, Mode::Tlb | Mode::Alb)
    }

    /// Modes where every up slave carries traffic
    pub fn is_trunk(&self) -> bool {
        matches!(self, Mode::RoundRobin | Mode::Xor | Mode::Broadcast)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// When a returning primary may preempt the current active slave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReselectPolicy {
    #[default]
    Always,
    #[serde(rename = "better")]
    BetterSpeedDuplex,
    #[serde(rename = "failure")]
    OnFailureOnly,
}

/// Header fields hashed by XOR and aggregator modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum XmitHashPolicy {
    #[default]
    #[serde(rename = "layer2")]
    Layer2,
    #[serde(rename = "layer2+3")]
    Layer23,
    #[serde(rename = "layer3+4")]
    Layer34,
}

/// Which slaves must see validated ARP replies to count as alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArpValidate {
    #[default]
    None,
    Active,
    Backup,
    All,
}

impl ArpValidate {
    /// Whether validation applies to a slave with the given activity flag
    pub fn applies_to(&self, active: bool) -> bool {
        match self {
            ArpValidate::None => false,
            ArpValidate::Active => active,
            ArpValidate::Backup => !active,
            ArpValidate::All => true,
        }
    }
}

/// Whether any or every ARP target must answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArpAllTargets {
    #[default]
    Any,
    All,
}

/// Hardware address handling on failover (active-backup only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailOverMac {
    /// Every slave carries the bond's address
    #[default]
    None,
    /// The bond takes over the active slave's address
    Active,
    /// The new active slave takes the old active slave's address
    Follow,
}

fn default_num_peer_notif() -> u8 {
    1
}

fn default_packets_per_slave() -> u32 {
    1
}

/// Bond configuration as written by the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BondConfig {
    #[serde(default)]
    pub mode: Mode,

    /// MII link monitor interval. Mutually exclusive with `arp_interval`.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub miimon: Option<Duration>,

    /// Time a link must stay up before it is used (rounded down to whole ticks)
    #[serde(default, with = "humantime_serde")]
    pub updelay: Duration,

    /// Time a link must stay down before it is dropped (rounded down to whole ticks)
    #[serde(default, with = "humantime_serde")]
    pub downdelay: Duration,

    /// ARP monitor interval. Mutually exclusive with `miimon`.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub arp_interval: Option<Duration>,

    #[serde(default)]
    pub arp_ip_targets: Vec<Ipv4Addr>,

    #[serde(default)]
    pub arp_validate: ArpValidate,

    #[serde(default)]
    pub arp_all_targets: ArpAllTargets,

    /// Bond's own IPv4 address, used to check the target of ARP replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arp_source: Option<Ipv4Addr>,

    /// Preferred slave (interface name) for active-backup/TLB/ALB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,

    #[serde(default)]
    pub primary_reselect: ReselectPolicy,

    #[serde(default)]
    pub fail_over_mac: FailOverMac,

    #[serde(default)]
    pub xmit_hash_policy: XmitHashPolicy,

    /// Round-robin batch size (0 = random slave per packet)
    #[serde(default = "default_packets_per_slave")]
    pub packets_per_slave: u32,

    /// Peer announcements sent after each active-backup failover
    #[serde(default = "default_num_peer_notif")]
    pub num_peer_notif: u8,

    /// Bond hardware address. Defaults to the first slave's address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_addr: Option<MacAddr>,

    /// Keep the active slave promiscuous
    #[serde(default)]
    pub promiscuous: bool,

    /// Keep the active slave in all-multicast mode
    #[serde(default)]
    pub all_multicast: bool,
}

impl Default for BondConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            miimon: None,
            updelay: Duration::ZERO,
            downdelay: Duration::ZERO,
            arp_interval: None,
            arp_ip_targets: Vec::new(),
            arp_validate: ArpValidate::default(),
            arp_all_targets: ArpAllTargets::default(),
            arp_source: None,
            primary: None,
            primary_reselect: ReselectPolicy::default(),
            fail_over_mac: FailOverMac::default(),
            xmit_hash_policy: XmitHashPolicy::default(),
            packets_per_slave: default_packets_per_slave(),
            num_peer_notif: default_num_peer_notif(),
            hw_addr: None,
            promiscuous: false,
            all_multicast: false,
        }
    }
}

/// Rejected configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("MII and ARP monitoring cannot be enabled at the same time")]
    ConflictingMonitors,

    #[error("mode {0} requires MII link monitoring")]
    MonitorRequiresMii(Mode),

    #[error("updelay/downdelay require MII link monitoring")]
    DelayWithoutMii,

    #[error("too many ARP targets: {0} (max {MAX_ARP_TARGETS})")]
    TooManyArpTargets(usize),

    #[error("ARP monitoring requires at least one target")]
    ArpWithoutTargets,

    #[error("unusable ARP target {0}")]
    UnusableArpTarget(Ipv4Addr),

    #[error("arp_validate requires ARP monitoring")]
    ArpValidateWithoutArp,

    #[error("arp_validate is only supported in active-backup mode")]
    ArpValidateRequiresActiveBackup,

    #[error("{0} interval must be non-zero")]
    ZeroInterval(&'static str),

    #[error("packets_per_slave out of range: {0} (max {MAX_PACKETS_PER_SLAVE})")]
    PacketsPerSlaveOutOfRange(u32),
}

/// MII monitor parameters, delays expressed in ticks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiiParams {
    pub interval: Duration,
    pub up_delay_ticks: u32,
    pub down_delay_ticks: u32,
}

/// ARP monitor parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpParams {
    pub interval: Duration,
    pub targets: Vec<Ipv4Addr>,
    pub validate: ArpValidate,
    pub all_targets: ArpAllTargets,
    pub source: Option<Ipv4Addr>,
}

/// Link monitoring strategy. Exactly one is in force per bond.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorStrategy {
    Mii(MiiParams),
    Arp(ArpParams),
}

impl MonitorStrategy {
    pub fn interval(&self) -> Duration {
        match self {
            MonitorStrategy::Mii(p) => p.interval,
            MonitorStrategy::Arp(p) => p.interval,
        }
    }

    pub fn arp(&self) -> Option<&ArpParams> {
        match self {
            MonitorStrategy::Arp(p) => Some(p),
            MonitorStrategy::Mii(_) => None,
        }
    }
}

/// Round-robin slave advance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketsPerSlave {
    /// Pick a random slave for every packet
    Random,
    /// Advance after every packet
    Each,
    /// Advance after `count` packets
    Batch { count: u32, reciprocal: Reciprocal },
}

impl PacketsPerSlave {
    pub fn from_count(count: u32) -> Result<Self, ConfigError> {
        match count {
            0 => Ok(Self::Random),
            1 => Ok(Self::Each),
            n if n > MAX_PACKETS_PER_SLAVE => Err(ConfigError::PacketsPerSlaveOutOfRange(n)),
            n => Ok(Self::Batch {
                count: n,
                reciprocal: Reciprocal::new(n),
            }),
        }
    }
}

/// Validated bond parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondParams {
    pub mode: Mode,
    pub monitor: MonitorStrategy,
    pub primary: Option<String>,
    pub reselect: ReselectPolicy,
    pub fail_over_mac: FailOverMac,
    pub xmit_hash_policy: XmitHashPolicy,
    pub packets_per_slave: PacketsPerSlave,
    pub num_peer_notif: u8,
    pub hw_addr: Option<MacAddr>,
    pub promiscuous: bool,
    pub all_multicast: bool,
}

impl BondParams {
    /// ARP interval and target count, for slave stamp initialisation
    pub(crate) fn arp_shape(&self) -> Option<(Duration, usize)> {
        self.monitor.arp().map(|p| (p.interval, p.targets.len()))
    }
}

fn delay_ticks(delay: Duration, interval: Duration, what: &str) -> u32 {
    let interval_ms = interval.as_millis().max(1);
    let delay_ms = delay.as_millis();
    if delay_ms % interval_ms != 0 {
        warn!(
            "{what} ({} ms) is not a multiple of miimon ({} ms), rounding down to {} ms",
            delay_ms,
            interval_ms,
            (delay_ms / interval_ms) * interval_ms
        );
    }
    u32::try_from(delay_ms / interval_ms).unwrap_or(u32::MAX)
}

fn usable_arp_target(ip: &Ipv4Addr) -> bool {
    !(ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast())
}

impl BondConfig {
    /// Parse a bond config from TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("failed to parse bond config")
    }

    /// Check cross-field rules and derive the runtime parameters.
    pub fn validate(&self) -> Result<BondParams, ConfigError> {
        let has_delays = !self.updelay.is_zero() || !self.downdelay.is_zero();

        if self.arp_validate != ArpValidate::None && self.arp_interval.is_none() {
            return Err(ConfigError::ArpValidateWithoutArp);
        }

        let monitor = match (self.miimon, self.arp_interval) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingMonitors),
            (None, Some(interval)) => {
                if self.mode.uses_aggregator() {
                    return Err(ConfigError::MonitorRequiresMii(self.mode));
                }
                if has_delays {
                    return Err(ConfigError::DelayWithoutMii);
                }
                if interval.is_zero() {
                    return Err(ConfigError::ZeroInterval("arp_interval"));
                }
                MonitorStrategy::Arp(self.arp_params(interval)?)
            }
            (miimon, None) => {
                let interval = miimon.unwrap_or(DEFAULT_MIIMON);
                if interval.is_zero() {
                    return Err(ConfigError::ZeroInterval("miimon"));
                }
                if miimon.is_none() {
                    warn!(
                        "no link monitoring configured, using MII at {} ms",
                        interval.as_millis()
                    );
                }
                MonitorStrategy::Mii(MiiParams {
                    interval,
                    up_delay_ticks: delay_ticks(self.updelay, interval, "updelay"),
                    down_delay_ticks: delay_ticks(self.downdelay, interval, "downdelay"),
                })
            }
        };

        let primary = match self.primary.as_deref() {
            Some("") | None => None,
            Some(name) if !self.mode.uses_primary() => {
                warn!("{} mode does not support a primary slave, ignoring {name}", self.mode);
                None
            }
            Some(name) => Some(name.to_string()),
        };

        if self.fail_over_mac != FailOverMac::None && self.mode != Mode::ActiveBackup {
            warn!("fail_over_mac only affects active-backup mode");
        }
        if self.xmit_hash_policy != XmitHashPolicy::default()
            && !matches!(self.mode, Mode::Xor | Mode::Lacp)
        {
            warn!("{} mode does not hash, ignoring xmit_hash_policy", self.mode);
        }

        Ok(BondParams {
            mode: self.mode,
            monitor,
            primary,
            reselect: self.primary_reselect,
            fail_over_mac: self.fail_over_mac,
            xmit_hash_policy: self.xmit_hash_policy,
            packets_per_slave: PacketsPerSlave::from_count(self.packets_per_slave)?,
            num_peer_notif: self.num_peer_notif,
            hw_addr: self.hw_addr,
            promiscuous: self.promiscuous,
            all_multicast: self.all_multicast,
        })
    }

    fn arp_params(&self, interval: Duration) -> Result<ArpParams, ConfigError> {
        if self.arp_ip_targets.len() > MAX_ARP_TARGETS {
            return Err(ConfigError::TooManyArpTargets(self.arp_ip_targets.len()));
        }
        let mut targets: Vec<Ipv4Addr> = Vec::with_capacity(self.arp_ip_targets.len());
        for ip in &self.arp_ip_targets {
            if !usable_arp_target(ip) {
                return Err(ConfigError::UnusableArpTarget(*ip));
            }
            if targets.contains(ip) {
                warn!("duplicate ARP target {ip}, ignoring");
                continue;
            }
            targets.push(*ip);
        }
        if targets.is_empty() {
            return Err(ConfigError::ArpWithoutTargets);
        }
        if self.arp_validate != ArpValidate::None && self.mode != Mode::ActiveBackup {
            return Err(ConfigError::ArpValidateRequiresActiveBackup);
        }
        Ok(ArpParams {
            interval,
            targets,
            validate: self.arp_validate,
            all_targets: self.arp_all_targets,
            source: self.arp_source,
        })
    }
}

/// Read a TOML bond config. A missing file yields the defaults.
pub fn load(path: &Path) -> Result<BondConfig> {
    if !path.exists() {
        return Ok(BondConfig::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let cfg: BondConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
    Ok(cfg)
}

/// Write a bond config as TOML.
pub fn save(path: &Path, cfg: &BondConfig, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        anyhow::bail!("config already exists at {}", path.display());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
    }
    let raw = toml::to_string_pretty(cfg).context("failed to serialize config to TOML")?;
    fs::write(path, raw).with_context(|| format!("failed to write config: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arp_config(mode: Mode) -> BondConfig {
        BondConfig {
            mode,
            arp_interval: Some(Duration::from_millis(100)),
            arp_ip_targets: vec![Ipv4Addr::new(192, 0, 2, 1)],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_uses_mii() {
        let params = BondConfig::default().validate().unwrap();
        assert_eq!(params.mode, Mode::RoundRobin);
        assert!(matches!(
            params.monitor,
            MonitorStrategy::Mii(MiiParams { interval, .. }) if interval == DEFAULT_MIIMON
        ));
        assert_eq!(params.packets_per_slave, PacketsPerSlave::Each);
        assert_eq!(params.num_peer_notif, 1);
    }

    #[test]
    fn test_delays_round_down_to_ticks() {
        let cfg = BondConfig {
            miimon: Some(Duration::from_millis(100)),
            updelay: Duration::from_millis(250),
            downdelay: Duration::from_millis(200),
            ..Default::default()
        };
        let params = cfg.validate().unwrap();
        let MonitorStrategy::Mii(mii) = params.monitor else {
            panic!("expected MII monitor");
        };
        assert_eq!(mii.up_delay_ticks, 2);
        assert_eq!(mii.down_delay_ticks, 2);
    }

    #[test]
    fn test_conflicting_monitors_rejected() {
        let cfg = BondConfig {
            miimon: Some(Duration::from_millis(100)),
            ..arp_config(Mode::ActiveBackup)
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ConflictingMonitors));
    }

    #[test]
    fn test_arp_rules() {
        assert!(arp_config(Mode::ActiveBackup).validate().is_ok());
        assert_eq!(
            arp_config(Mode::Lacp).validate(),
            Err(ConfigError::MonitorRequiresMii(Mode::Lacp))
        );

        let no_targets = BondConfig {
            arp_ip_targets: vec![],
            ..arp_config(Mode::ActiveBackup)
        };
        assert_eq!(no_targets.validate(), Err(ConfigError::ArpWithoutTargets));

        let bad_target = BondConfig {
            arp_ip_targets: vec![Ipv4Addr::BROADCAST],
            ..arp_config(Mode::ActiveBackup)
        };
        assert_eq!(
            bad_target.validate(),
            Err(ConfigError::UnusableArpTarget(Ipv4Addr::BROADCAST))
        );

        let too_many = BondConfig {
            arp_ip_targets: (1..=17).map(|i| Ipv4Addr::new(10, 0, 0, i)).collect(),
            ..arp_config(Mode::ActiveBackup)
        };
        assert_eq!(too_many.validate(), Err(ConfigError::TooManyArpTargets(17)));

        let delays = BondConfig {
            updelay: Duration::from_millis(100),
            ..arp_config(Mode::ActiveBackup)
        };
        assert_eq!(delays.validate(), Err(ConfigError::DelayWithoutMii));
    }

    #[test]
    fn test_duplicate_arp_targets_are_dropped() {
        let cfg = BondConfig {
            arp_ip_targets: vec![Ipv4Addr::new(192, 0, 2, 1), Ipv4Addr::new(192, 0, 2, 1)],
            ..arp_config(Mode::ActiveBackup)
        };
        let params = cfg.validate().unwrap();
        assert_eq!(params.monitor.arp().unwrap().targets.len(), 1);
    }

    #[test]
    fn test_arp_validate_rules() {
        let without_arp = BondConfig {
            arp_validate: ArpValidate::All,
            ..Default::default()
        };
        assert_eq!(without_arp.validate(), Err(ConfigError::ArpValidateWithoutArp));

        let wrong_mode = BondConfig {
            arp_validate: ArpValidate::Active,
            ..arp_config(Mode::Xor)
        };
        assert_eq!(
            wrong_mode.validate(),
            Err(ConfigError::ArpValidateRequiresActiveBackup)
        );
    }

    #[test]
    fn test_primary_ignored_outside_primary_modes() {
        let cfg = BondConfig {
            mode: Mode::Xor,
            primary: Some("eth0".into()),
            ..Default::default()
        };
        assert_eq!(cfg.validate().unwrap().primary, None);

        let cfg = BondConfig {
            mode: Mode::ActiveBackup,
            primary: Some("eth0".into()),
            ..Default::default()
        };
        assert_eq!(cfg.validate().unwrap().primary.as_deref(), Some("eth0"));
    }

    #[test]
    fn test_packets_per_slave_range() {
        assert_eq!(PacketsPerSlave::from_count(0), Ok(PacketsPerSlave::Random));
        assert!(matches!(
            PacketsPerSlave::from_count(3),
            Ok(PacketsPerSlave::Batch { count: 3, .. })
        ));
        assert_eq!(
            PacketsPerSlave::from_count(70_000),
            Err(ConfigError::PacketsPerSlaveOutOfRange(70_000))
        );
    }

    #[test]
    fn test_zero_interval_rejected() {
        let cfg = BondConfig {
            miimon: Some(Duration::ZERO),
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroInterval("miimon")));
    }

    #[test]
    fn test_toml_parsing() {
        let raw = r#"
            mode = "active-backup"
            miimon = "100ms"
            updelay = "200ms"
            primary = "eth0"
            primary_reselect = "better"
            fail_over_mac = "follow"
            hw_addr = "02:00:00:00:00:01"
        "#;
        let cfg = BondConfig::from_toml_str(raw).unwrap();
        assert_eq!(cfg.mode, Mode::ActiveBackup);
        assert_eq!(cfg.miimon, Some(Duration::from_millis(100)));
        assert_eq!(cfg.updelay, Duration::from_millis(200));
        assert_eq!(cfg.primary_reselect, ReselectPolicy::BetterSpeedDuplex);
        assert_eq!(cfg.fail_over_mac, FailOverMac::Follow);
        assert_eq!(cfg.hw_addr, Some(MacAddr::new([2, 0, 0, 0, 0, 1])));
        assert_eq!(cfg.num_peer_notif, 1);

        assert!(BondConfig::from_toml_str(r#"mode = "round-robin""#).is_err());
        assert!(BondConfig::from_toml_str(r#"hw_addr = "02:00""#).is_err());
    }

    #[test]
    fn test_load_missing_file_yields_default() {
        let path = std::env::temp_dir().join(format!(
            "bonding-core-missing-{}.toml",
            std::process::id()
        ));
        assert_eq!(load(&path).unwrap(), BondConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = std::env::temp_dir().join(format!("bonding-core-cfg-{}", std::process::id()));
        let path = dir.join("bond0.toml");
        let cfg = BondConfig {
            mode: Mode::Xor,
            miimon: Some(Duration::from_millis(50)),
            xmit_hash_policy: XmitHashPolicy::Layer34,
            ..Default::default()
        };
        save(&path, &cfg, true).unwrap();
        assert!(save(&path, &cfg, false).is_err());
        assert_eq!(load(&path).unwrap(), cfg);
        let _ = fs::remove_dir_all(&dir);
    }
}
