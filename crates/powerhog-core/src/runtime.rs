//! Process-wide coordination state shared by the collection loop and workers.
//!
//! Workers coordinate only through two values:
//!
//! - [`Shutdown`]: a cancellation flag that is set once and polled cooperatively.
//!   It also counts interrupt requests so the daemon can force-quit on the second.
//! - [`Tick`]: a wall-clock timestamp refreshed once per second by a dedicated worker.
//!   Readers use it instead of `Utc::now()` so that time spent in host sleep (when the
//!   tick worker is frozen too) never looks like elapsed time.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::storage::model::Snapshot;

/// Granularity at which background sleeps re-check the shutdown flag.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Process exit statuses. Values are part of the external contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitStatus {
    Normal = 0,
    MissingPrivilege = 1,
    ForcedQuit = 2,
    /// Fatal runtime failure (malformed input, storage failure, liveness failure).
    Fatal = 3,
    DuplicateInstance = 4,
    UploadDeadlock = 5,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Why the shutdown flag was raised. The first reason recorded wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / SIGTERM.
    Interrupt,
    /// Offline input file fully consumed.
    EndOfInput,
    /// A liveness check failed; an external supervisor is expected to restart us.
    Liveness(String),
    /// Fatal error in the collection loop or a worker.
    Fatal(String),
    /// The upload watchdog expired.
    Deadlock,
}

impl ShutdownReason {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            ShutdownReason::Interrupt | ShutdownReason::EndOfInput => ExitStatus::Normal,
            ShutdownReason::Liveness(_) | ShutdownReason::Fatal(_) => ExitStatus::Fatal,
            ShutdownReason::Deadlock => ExitStatus::UploadDeadlock,
        }
    }
}

#[derive(Default)]
struct ShutdownInner {
    cancelled: AtomicBool,
    requests: AtomicU32,
    reason: OnceLock<ShutdownReason>,
}

/// Cooperative cancellation token shared by all workers.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag. Only the first reason is kept.
    pub fn cancel(&self, reason: ShutdownReason) {
        let _ = self.inner.reason.set(reason);
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<&ShutdownReason> {
        self.inner.reason.get()
    }

    /// Records an interrupt request and raises the flag.
    /// Returns how many requests have been received so far.
    pub fn request_interrupt(&self) -> u32 {
        let count = self.inner.requests.fetch_add(1, Ordering::SeqCst) + 1;
        self.cancel(ShutdownReason::Interrupt);
        count
    }

    /// Sleeps for `duration`, waking every [`POLL_INTERVAL`] to check the flag.
    ///
    /// Returns `false` if the flag was raised before the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while remaining > Duration::ZERO {
            if self.is_cancelled() {
                return false;
            }
            let step = remaining.min(POLL_INTERVAL);
            thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        !self.is_cancelled()
    }
}

/// Sleep-aware notion of "now" in epoch milliseconds.
#[derive(Clone)]
pub struct Tick {
    inner: Arc<Mutex<i64>>,
}

impl Default for Tick {
    fn default() -> Self {
        Self::new()
    }
}

impl Tick {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Utc::now().timestamp_millis())),
        }
    }

    pub fn now_ms(&self) -> i64 {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, epoch_ms: i64) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = epoch_ms;
    }

    pub fn refresh(&self) {
        self.set(Utc::now().timestamp_millis());
    }

    /// Tick worker body: refreshes the value once per second until shutdown.
    pub fn run(&self, shutdown: &Shutdown) {
        while !shutdown.is_cancelled() {
            self.refresh();
            thread::sleep(POLL_INTERVAL);
        }
        debug!("tick worker stopped");
    }
}

/// In-memory counters, exposed for diagnostics only.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub snapshots: u64,
    pub combined_energy_mj: i64,
    pub cpu_energy_mj: i64,
    pub gpu_energy_mj: i64,
    pub ane_energy_mj: i64,
    pub energy_impact: f64,
    pub uploaded_rows: u64,
    pub failed_uploads: u64,
    pub rollups: u64,
}

#[derive(Default)]
pub struct Stats {
    inner: Mutex<StatsSnapshot>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, f: impl FnOnce(&mut StatsSnapshot)) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }

    pub fn record_snapshot(&self, snapshot: &Snapshot) {
        self.update(|s| {
            s.snapshots += 1;
            s.combined_energy_mj += snapshot.combined_energy_mj;
            s.cpu_energy_mj += snapshot.cpu_energy_mj;
            s.gpu_energy_mj += snapshot.gpu_energy_mj;
            s.ane_energy_mj += snapshot.ane_energy_mj;
            s.energy_impact += snapshot.energy_impact;
        });
    }

    pub fn record_upload(&self, rows: usize) {
        self.update(|s| s.uploaded_rows += rows as u64);
    }

    pub fn record_upload_failure(&self) {
        self.update(|s| s.failed_uploads += 1);
    }

    pub fn record_rollup(&self) {
        self.update(|s| s.rollups += 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
