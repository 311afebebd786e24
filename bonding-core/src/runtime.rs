//! Periodic link monitor task.
//!
//! One tokio task per bond fires [`Bond::monitor_tick`] every monitor
//! interval until told to stop. Shutdown is explicit: [`MonitorHandle::shutdown`]
//! stops the task, waits for any in-flight tick to finish, and only then
//! releases the slaves. Ticks and shutdown both read tokio's clock, so a
//! paused or advanced test clock stays consistent across them.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::bond::{Bond, TickOutcome};
use crate::slave::Slave;

/// Handle on a running monitor task
#[derive(Debug)]
pub struct MonitorHandle {
    bond: Arc<Bond>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Start monitoring `bond` on the current tokio runtime.
pub fn spawn_monitor(bond: Arc<Bond>) -> MonitorHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(run_monitor(Arc::clone(&bond), stop_rx));
    MonitorHandle {
        bond,
        stop: stop_tx,
        task,
    }
}

async fn run_monitor(bond: Arc<Bond>, mut stop: watch::Receiver<bool>) {
    let period = bond.params().monitor.interval();
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick of an interval completes immediately
    tick.tick().await;

    info!(bond = %bond.name(), period_ms = period.as_millis() as u64, "link monitor started");
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = tokio::time::Instant::now().into_std();
                if let TickOutcome::Committed { applied } = bond.monitor_tick(now) {
                    debug!(bond = %bond.name(), applied, "link changes committed");
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
    info!(bond = %bond.name(), "link monitor stopped");
}

impl MonitorHandle {
    pub fn bond(&self) -> &Arc<Bond> {
        &self.bond
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the task and wait for it to exit. The slaves stay enslaved.
    pub async fn stop(self) -> Arc<Bond> {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(bond = %self.bond.name(), "monitor task ended abnormally: {e}");
        }
        self.bond
    }

    /// Stop monitoring, then release every slave.
    pub async fn shutdown(self) -> Vec<Slave> {
        let bond = self.stop().await;
        let released = bond.release_all(tokio::time::Instant::now().into_std());
        info!(bond = %bond.name(), released = released.len(), "bond shut down");
        released
    }
}
