//! Core library for link aggregation ("bonding").
//!
//! A bond groups several physical links (slaves) behind one logical
//! interface. This crate is the control plane: it watches slave health,
//! decides which slave is active, and picks the slave(s) each outgoing frame
//! is sent on. Devices and the host network stack are reached through the
//! traits in [`device`], so the core runs the same against real adapters and
//! test fakes.
//!
//! # Architecture
//!
//! - `config`: bond configuration, TOML loading and validation
//! - `device`: collaborator traits (link driver, host stack, aggregator)
//! - `slave` / `registry`: member links and the ordered, snapshot-published set
//! - `monitor`: MII and ARP link monitoring (inspect, then commit)
//! - `failover`: active slave selection and reselect policy
//! - `frame` / `xmit`: header dissection and per-mode transmit selection
//! - `bond`: the controller tying it together
//! - `bonds`: named bonds of a host
//! - `runtime`: tokio task driving the monitor
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use bonding_core::{Bond, BondConfig, Collaborators, HostStack, LinkDriver, SlaveSpec, MacAddr};
//! # async fn example(driver: Arc<dyn LinkDriver>, host: Arc<dyn HostStack>) -> anyhow::Result<()> {
//! let config: BondConfig = toml::from_str(r#"
//!     mode = "active-backup"
//!     miimon = "100ms"
//! "#)?;
//! let bond = Arc::new(Bond::new("bond0", &config, Collaborators::new(driver, host))?);
//! bond.enslave(SlaveSpec::new("eth0", MacAddr::new([2, 0, 0, 0, 0, 1])), std::time::Instant::now())?;
//! let monitor = bonding_core::spawn_monitor(bond);
//! // ...
//! monitor.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod bond;
pub mod bonds;
pub mod config;
pub mod device;
pub mod failover;
pub mod frame;
pub mod monitor;
pub mod registry;
pub mod runtime;
pub mod slave;
pub mod xmit;

pub use bond::{Bond, BondError, BondInfo, TickOutcome};
pub use bonds::BondRegistry;
pub use config::{BondConfig, BondParams, ConfigError, Mode};
pub use device::{
    Aggregator, CollaboratorError, Collaborators, Duplex, HostStack, LinkDriver, LinkEvent, MacAddr,
};
pub use frame::Frame;
pub use registry::{RegistrySnapshot, SlaveView};
pub use runtime::{spawn_monitor, MonitorHandle};
pub use slave::{LinkState, RxStamps, Slave, SlaveId, SlaveInfo, SlaveSpec};
pub use xmit::TxDecision;
