//! Deadline watchdog for blocking upload calls.
//!
//! A network call that hangs past every client timeout would stall the
//! uploader forever, with undelivered rows piling up. The watchdog thread
//! watches an armed deadline; on expiry it raises cancellation, gives the
//! process a grace period to stop on its own, and then calls `on_expire`
//! (the daemon exits there with the upload-deadlock status).

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::runtime::{Shutdown, ShutdownReason};

#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    /// How often the deadline is checked.
    pub poll: Duration,
    /// Time between raising cancellation and `on_expire`.
    pub grace: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll: Duration::from_secs(1),
            grace: Duration::from_secs(5),
        }
    }
}

type Deadline = Arc<Mutex<Option<Instant>>>;

fn lock(deadline: &Deadline) -> std::sync::MutexGuard<'_, Option<Instant>> {
    deadline.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Watchdog {
    deadline: Deadline,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn(
        shutdown: Shutdown,
        config: WatchdogConfig,
        on_expire: impl FnOnce() + Send + 'static,
    ) -> io::Result<Self> {
        let deadline: Deadline = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let deadline = deadline.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("upload-watchdog".into())
                .spawn(move || watch(&deadline, &stop, &shutdown, config, on_expire))?
        };

        Ok(Self {
            deadline,
            stop,
            handle: Some(handle),
        })
    }

    /// Arms the deadline `limit` from now. Dropping the guard disarms it.
    pub fn arm(&self, limit: Duration) -> WatchdogGuard<'_> {
        *lock(&self.deadline) = Some(Instant::now() + limit);
        WatchdogGuard { watchdog: self }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub struct WatchdogGuard<'a> {
    watchdog: &'a Watchdog,
}

impl Drop for WatchdogGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.watchdog.deadline) = None;
    }
}

fn watch(
    deadline: &Deadline,
    stop: &AtomicBool,
    shutdown: &Shutdown,
    config: WatchdogConfig,
    on_expire: impl FnOnce(),
) {
    while !stop.load(Ordering::SeqCst) {
        thread::sleep(config.poll);

        let expired = lock(deadline).is_some_and(|at| Instant::now() >= at);
        if !expired {
            continue;
        }

        error!("upload did not finish before its deadline, shutting down");
        shutdown.cancel(ShutdownReason::Deadlock);
        thread::sleep(config.grace);

        if lock(deadline).is_some() {
            error!("upload still blocked after grace period");
            on_expire();
        } else {
            debug!("blocked upload returned during grace period");
        }
        return;
    }
}
