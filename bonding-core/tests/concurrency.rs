//! Transmit and receive paths running against the bond's writer side.

mod common;

use anyhow::Result;
use bonding_core::{
    Bond, BondConfig, Frame, Mode, RegistrySnapshot, TickOutcome, TxDecision,
};
use common::{collaborators, id, init_tracing, l2_frame, spec, FakeNet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(100);
const ROUNDS: usize = 400;
const TRANSMITTERS: usize = 3;

fn new_bond(net: &Arc<FakeNet>, config: &BondConfig) -> Result<Bond> {
    init_tracing();
    Ok(Bond::new("bond0", config, collaborators(net))?)
}

fn check_decision(mode: Mode, snapshot: &RegistrySnapshot, decision: Option<TxDecision>) {
    let version = snapshot.version();
    if mode.uses_primary() {
        let active = snapshot.iter().filter(|s| s.active).count();
        assert!(active <= 1, "{active} active slaves in snapshot {version}");
        if let Some(current) = snapshot.current_active() {
            assert!(current.active, "current {} not active in snapshot {version}", current.id);
        }
    }
    let Some(decision) = decision else {
        return;
    };
    for target in decision.targets() {
        let Some(view) = snapshot.find(target) else {
            panic!("{target} is not in snapshot {version}");
        };
        if mode == Mode::ActiveBackup {
            assert_eq!(snapshot.current_active().map(|s| &s.id), Some(target));
        } else {
            assert!(view.can_transmit(), "{target} cannot transmit in snapshot {version}");
        }
    }
}

/// Transmitters race enslave/release, monitor ticks and manual failover.
fn contend(mode: Mode) -> Result<()> {
    let net = FakeNet::new();
    for name in ["s1", "s2", "s3"] {
        net.set_link(name, true);
    }
    let config = BondConfig {
        mode,
        miimon: Some(TICK),
        ..Default::default()
    };
    let bond = new_bond(&net, &config)?;
    bond.enslave(spec("s1", 1), Instant::now())?;
    bond.enslave(spec("s2", 2), Instant::now())?;

    let done = AtomicBool::new(false);
    let checked = AtomicUsize::new(0);
    let frame = l2_frame(9, 1);

    thread::scope(|outer| {
        for _ in 0..TRANSMITTERS {
            outer.spawn(|| {
                let mut n = 0;
                while !done.load(Ordering::Relaxed) {
                    let snapshot = bond.snapshot();
                    let decision = bond.transmit_with(&Frame::new(&frame), &snapshot);
                    check_decision(mode, &snapshot, decision);
                    n += 1;
                }
                checked.fetch_add(n, Ordering::Relaxed);
            });
        }

        thread::scope(|inner| {
            inner.spawn(|| {
                for round in 0..ROUNDS {
                    if round % 2 == 0 {
                        let _ = bond.enslave(spec("s3", 3), Instant::now());
                    } else {
                        let _ = bond.release(&id("s3"), Instant::now());
                    }
                }
            });
            inner.spawn(|| {
                for round in 0..ROUNDS {
                    net.set_link("s2", round % 4 < 2);
                    bond.monitor_tick(Instant::now());
                }
            });
            inner.spawn(|| {
                for round in 0..ROUNDS {
                    let target = if round % 2 == 0 { "s1" } else { "s3" };
                    let _ = bond.set_active(&id(target), Instant::now());
                }
            });
        });
        done.store(true, Ordering::Relaxed);
    });

    assert!(checked.load(Ordering::Relaxed) > 0);
    let info = bond.info();
    if let Some(current) = info.current_active {
        assert!(bond.contains(&current));
    }
    check_decision(mode, &bond.snapshot(), bond.transmit(&Frame::new(&frame)));
    Ok(())
}

#[test]
fn test_active_backup_transmit_during_churn() -> Result<()> {
    contend(Mode::ActiveBackup)
}

#[test]
fn test_round_robin_transmit_during_churn() -> Result<()> {
    contend(Mode::RoundRobin)
}

#[test]
fn test_receive_stamps_do_not_starve_monitor() -> Result<()> {
    let net = FakeNet::new();
    net.set_link("s1", true);
    net.set_link("s2", true);
    let target = Ipv4Addr::new(192, 0, 2, 1);
    let config = BondConfig {
        mode: Mode::ActiveBackup,
        arp_interval: Some(TICK),
        arp_ip_targets: vec![target],
        ..Default::default()
    };
    let bond = new_bond(&net, &config)?;
    let mut now = Instant::now();
    bond.enslave(spec("s1", 1), now)?;
    bond.enslave(spec("s2", 2), now)?;

    let done = AtomicBool::new(false);
    let mut skipped = 0;
    let mut committed = 0;
    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                while !done.load(Ordering::Relaxed) {
                    bond.frame_received(&id("s2"), Instant::now());
                    bond.arp_received(&id("s2"), target, Ipv4Addr::new(192, 0, 2, 10), Instant::now());
                }
            });
        }
        for _ in 0..1000 {
            now += TICK;
            match bond.monitor_tick(now) {
                TickOutcome::Skipped => skipped += 1,
                TickOutcome::Committed { .. } => committed += 1,
                TickOutcome::Idle => {}
            }
        }
        done.store(true, Ordering::Relaxed);
    });

    assert_eq!(skipped, 0, "ticks skipped while only receive stamps were written");
    // s1 never hears a reply, so the monitor has to take it down
    assert!(committed > 0);
    assert!(bond
        .slave_info(&id("s1"))
        .is_some_and(|s| s.failure_count >= 1));
    Ok(())
}
