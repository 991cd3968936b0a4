//! Liveness checks.
//!
//! Two independent workers guard against a collector that is running but no
//! longer producing data: one checks that samples keep arriving in the store,
//! the other that the measurement process still exists. Either failure raises
//! cancellation so that an external supervisor can restart the daemon.

use std::time::Duration;

use tracing::{debug, error};

use crate::runtime::{Shutdown, ShutdownReason, Tick};
use crate::storage::{StorageError, Store};
use crate::util::ProcessTable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Stale(String),
}

/// Fails when the newest stored sample is older than `tick − period`,
/// or when nothing has been stored at all.
pub fn check_freshness(store: &Store, tick: &Tick, period: Duration) -> Result<Liveness, StorageError> {
    let threshold = tick.now_ms() - period.as_millis() as i64;
    Ok(match store.latest_sample_time()? {
        Some(latest) if latest >= threshold => Liveness::Alive,
        Some(latest) => Liveness::Stale(format!(
            "no sample for {}s (latest at {latest})",
            (tick.now_ms() - latest) / 1000
        )),
        None => Liveness::Stale("no samples stored yet".into()),
    })
}

pub fn check_presence(table: &mut dyn ProcessTable, process: &str) -> Liveness {
    table.refresh();
    if table.is_running(process) {
        Liveness::Alive
    } else {
        Liveness::Stale(format!("{process} is not running"))
    }
}

/// Freshness worker body. Sleeps first, so the first check happens one full
/// period after start.
pub fn run_freshness_loop(store: Store, tick: &Tick, period: Duration, shutdown: &Shutdown) {
    while shutdown.sleep(period) {
        match check_freshness(&store, tick, period) {
            Ok(Liveness::Alive) => debug!("samples are fresh"),
            Ok(Liveness::Stale(reason)) => {
                error!(%reason, "measurement data is stale, shutting down");
                shutdown.cancel(ShutdownReason::Liveness(reason));
                return;
            }
            Err(e) => {
                error!(error = %e, "freshness check failed");
                shutdown.cancel(ShutdownReason::Fatal(format!("freshness check failed: {e}")));
                return;
            }
        }
    }
    debug!("freshness worker stopped");
}

/// Presence worker body.
pub fn run_presence_loop(
    mut table: Box<dyn ProcessTable>,
    process: &str,
    period: Duration,
    shutdown: &Shutdown,
) {
    while shutdown.sleep(period) {
        match check_presence(table.as_mut(), process) {
            Liveness::Alive => debug!(process, "measurement process is running"),
            Liveness::Stale(reason) => {
                error!(%reason, "measurement process is gone, shutting down");
                shutdown.cancel(ShutdownReason::Liveness(reason));
                return;
            }
        }
    }
    debug!("presence worker stopped");
}
