//! Parent process supervision for helper mode.
//!
//! A helper service must not outlive the application that spawned it, even
//! when that application dies without a goodbye. The watchdog probes the
//! parent pid on a fixed interval and cancels the shared shutdown token
//! once the parent is gone.

use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::log_event;

pub const DEFAULT_PARENT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Periodic liveness probe for the spawning process.
pub struct ParentWatchdog {
    parent_pid: u32,
    interval: Duration,
}

impl ParentWatchdog {
    pub fn new(parent_pid: u32, interval: Duration) -> Self {
        Self {
            parent_pid,
            interval,
        }
    }

    /// Runs until the parent disappears or `shutdown` fires. Cancels
    /// `shutdown` itself when the parent is gone, so the service loop and
    /// the watchdog share one exit path.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut system = System::new();
        let pid = Pid::from_u32(self.parent_pid);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    if !parent_alive(&mut system, pid) {
                        log_event!(
                            "daemon",
                            "parent exited",
                            "pid {} is gone, shutting down",
                            self.parent_pid
                        );
                        shutdown.cancel();
                        return;
                    }
                }
            }
        }
    }
}

fn parent_alive(system: &mut System, pid: Pid) -> bool {
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing(),
    );
    system.process(pid).is_some()
}
