//! Delivery of stored measurements to the remote collector.
//!
//! One cycle reads up to [`BATCH_SIZE`] undelivered rows, posts them as a JSON
//! array and deletes them once the collector answers `204 No Content`. Any
//! other outcome keeps the rows for the next cycle. Every request runs under
//! the [`watchdog`].

pub mod watchdog;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::runtime::{Shutdown, ShutdownReason, Stats};
use crate::storage::{MeasurementRow, StorageError, Store};
use watchdog::Watchdog;

pub const BATCH_SIZE: usize = 10;
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const WATCHDOG_LIMIT: Duration = Duration::from_secs(60);
/// Batches attempted on orderly shutdown.
pub const FINAL_DRAIN_BATCHES: usize = 3;

/// The only status that counts as delivered.
const DELIVERED: u16 = 204;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("upload request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Posts a JSON body and reports the HTTP status.
pub trait Transport: Send {
    fn post(&self, url: &str, body: Vec<u8>) -> Result<u16, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("powerhog/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn post(&self, url: &str, body: Vec<u8>) -> Result<u16, TransportError> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()?;
        Ok(response.status().as_u16())
    }
}

/// One element of the posted array.
#[derive(Debug, Serialize)]
pub struct UploadItem<'a> {
    pub time: i64,
    pub data: &'a str,
    /// JSON-encoded [`crate::config::UploadedSettings`].
    pub settings: &'a str,
    pub machine_uuid: &'a str,
    pub row_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing to send.
    Idle,
    /// Rows delivered and deleted.
    Delivered(usize),
    /// The collector answered with something other than 204.
    Rejected(u16),
    /// The request did not complete.
    Failed(String),
}

pub struct Uploader {
    store: Store,
    transport: Box<dyn Transport>,
    api_url: String,
    settings_json: String,
    machine_uuid: String,
    interval: Duration,
    stats: Arc<Stats>,
    watchdog: Option<Watchdog>,
    watchdog_limit: Duration,
}

impl Uploader {
    pub fn new(
        store: Store,
        transport: Box<dyn Transport>,
        settings: &Settings,
        machine_uuid: String,
        stats: Arc<Stats>,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            store,
            transport,
            api_url: settings.api_url.trim().to_string(),
            settings_json: serde_json::to_string(&settings.uploaded_settings())?,
            machine_uuid,
            interval: settings.upload_interval(),
            stats,
            watchdog: None,
            watchdog_limit: WATCHDOG_LIMIT,
        })
    }

    pub fn with_watchdog(mut self, watchdog: Watchdog) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    /// Overrides [`WATCHDOG_LIMIT`].
    pub fn with_watchdog_limit(mut self, limit: Duration) -> Self {
        self.watchdog_limit = limit;
        self
    }

    fn payload(&self, rows: &[MeasurementRow]) -> Result<Vec<u8>, StorageError> {
        let items: Vec<UploadItem<'_>> = rows
            .iter()
            .map(|row| UploadItem {
                time: row.time,
                data: &row.data,
                settings: &self.settings_json,
                machine_uuid: &self.machine_uuid,
                row_id: row.id,
            })
            .collect();
        Ok(serde_json::to_vec(&items)?)
    }

    /// Sends at most one batch.
    pub fn cycle(&mut self) -> Result<CycleOutcome, StorageError> {
        let rows = self.store.select_undelivered(BATCH_SIZE)?;
        if rows.is_empty() {
            return Ok(CycleOutcome::Idle);
        }
        let body = self.payload(&rows)?;

        let result = {
            let _armed = self.watchdog.as_ref().map(|w| w.arm(self.watchdog_limit));
            self.transport.post(&self.api_url, body)
        };

        match result {
            Ok(DELIVERED) => {
                let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
                let deleted = self.store.delete_delivered(&ids)?;
                self.stats.record_upload(deleted);
                debug!(rows = deleted, "uploaded batch");
                Ok(CycleOutcome::Delivered(deleted))
            }
            Ok(status) => {
                warn!(status, rows = rows.len(), "collector rejected batch, keeping rows");
                self.stats.record_upload_failure();
                Ok(CycleOutcome::Rejected(status))
            }
            Err(e) => {
                warn!(error = %e, rows = rows.len(), "upload failed, keeping rows");
                self.stats.record_upload_failure();
                Ok(CycleOutcome::Failed(e.to_string()))
            }
        }
    }

    /// Delivers up to `max_batches` batches, stopping at the first
    /// unsuccessful cycle. Returns the number of delivered rows.
    pub fn drain(&mut self, max_batches: usize) -> Result<usize, StorageError> {
        let mut delivered = 0;
        for _ in 0..max_batches {
            match self.cycle()? {
                CycleOutcome::Delivered(n) => delivered += n,
                _ => break,
            }
        }
        Ok(delivered)
    }

    /// Upload worker body. After a delivered batch the next cycle starts right
    /// away; otherwise the worker sleeps for the upload interval. On orderly
    /// shutdown a bounded final drain is attempted.
    pub fn run(&mut self, shutdown: &Shutdown) {
        while !shutdown.is_cancelled() {
            match self.cycle() {
                Ok(CycleOutcome::Delivered(_)) => continue,
                Ok(_) => {
                    if !shutdown.sleep(self.interval) {
                        break;
                    }
                }
                Err(e) if e.is_busy() => {
                    warn!(error = %e, "database busy, upload postponed");
                    if !shutdown.sleep(self.interval) {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "uploader cannot read the store");
                    shutdown.cancel(ShutdownReason::Fatal(format!("uploader failed: {e}")));
                    return;
                }
            }
        }

        if matches!(
            shutdown.reason(),
            Some(ShutdownReason::Interrupt | ShutdownReason::EndOfInput)
        ) {
            match self.drain(FINAL_DRAIN_BATCHES) {
                Ok(0) => {}
                Ok(rows) => info!(rows, "delivered pending rows before exit"),
                Err(e) => warn!(error = %e, "final upload failed"),
            }
        }
        debug!("upload worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::tests::sample_snapshot;
    use crate::storage::store::tests::{append, temp_store};
    use crate::upload::watchdog::WatchdogConfig;
    use std::collections::VecDeque;
    use std::sync::{Mutex, mpsc};
    use std::thread;
    use std::time::Instant;

    #[derive(Clone, Default)]
    struct FakeTransport {
        replies: Arc<Mutex<VecDeque<Result<u16, ()>>>>,
        bodies: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl FakeTransport {
        fn replying(replies: &[Result<u16, ()>]) -> Self {
            Self {
                replies: Arc::new(Mutex::new(replies.iter().copied().collect())),
                ..Default::default()
            }
        }

        fn posts(&self) -> usize {
            self.bodies.lock().unwrap().len()
        }
    }

    impl Transport for FakeTransport {
        fn post(&self, _url: &str, body: Vec<u8>) -> Result<u16, TransportError> {
            self.bodies.lock().unwrap().push(body);
            match self.replies.lock().unwrap().pop_front() {
                Some(Ok(status)) => Ok(status),
                // a builder error is the easiest reqwest::Error to produce offline
                _ => Err(TransportError::Http(
                    reqwest::blocking::Client::new()
                        .get("not a url")
                        .build()
                        .unwrap_err(),
                )),
            }
        }
    }

    /// Blocks every request until the test lets it go.
    struct HangingTransport {
        release: mpsc::Receiver<()>,
    }

    impl Transport for HangingTransport {
        fn post(&self, _url: &str, _body: Vec<u8>) -> Result<u16, TransportError> {
            let _ = self.release.recv_timeout(Duration::from_secs(10));
            Ok(204)
        }
    }

    fn uploader(
        rows: usize,
        transport: impl Transport + 'static,
        settings: &Settings,
    ) -> (tempfile::TempDir, Uploader) {
        let (dir, _path, mut store) = temp_store();
        for i in 0..rows {
            let mut snapshot = sample_snapshot();
            snapshot.timestamp += i as i64;
            append(&mut store, &snapshot);
        }
        let uploader = Uploader::new(
            store,
            Box::new(transport),
            settings,
            "machine-1".into(),
            Arc::new(Stats::new()),
        )
        .unwrap();
        (dir, uploader)
    }

    fn pending(uploader: &Uploader) -> usize {
        uploader.store.select_undelivered(100).unwrap().len()
    }

    #[test]
    fn accepted_batch_is_deleted() {
        let transport = FakeTransport::replying(&[Ok(204)]);
        let (_dir, mut uploader) = uploader(12, transport.clone(), &Settings::default());

        assert_eq!(uploader.cycle().unwrap(), CycleOutcome::Delivered(10));
        assert_eq!(pending(&uploader), 2);
        assert_eq!(uploader.stats.snapshot().uploaded_rows, 10);
    }

    #[test]
    fn rejected_batch_is_kept() {
        let transport = FakeTransport::replying(&[Ok(500), Ok(200)]);
        let (_dir, mut uploader) = uploader(12, transport.clone(), &Settings::default());

        assert_eq!(uploader.cycle().unwrap(), CycleOutcome::Rejected(500));
        // only 204 counts
        assert_eq!(uploader.cycle().unwrap(), CycleOutcome::Rejected(200));
        assert_eq!(pending(&uploader), 12);
        assert_eq!(uploader.stats.snapshot().failed_uploads, 2);
    }

    #[test]
    fn transport_error_keeps_rows() {
        let transport = FakeTransport::replying(&[Err(())]);
        let (_dir, mut uploader) = uploader(3, transport, &Settings::default());
        assert!(matches!(uploader.cycle().unwrap(), CycleOutcome::Failed(_)));
        assert_eq!(pending(&uploader), 3);
    }

    #[test]
    fn empty_store_is_idle_without_request() {
        let transport = FakeTransport::default();
        let (_dir, mut uploader) = uploader(0, transport.clone(), &Settings::default());
        assert_eq!(uploader.cycle().unwrap(), CycleOutcome::Idle);
        assert_eq!(transport.posts(), 0);
    }

    #[test]
    fn payload_carries_rows_and_reduced_settings() {
        let transport = FakeTransport::replying(&[Ok(204)]);
        let settings = Settings {
            electricitymaps_token: Some("secret-token".into()),
            ..Settings::default()
        };
        let (_dir, mut uploader) = uploader(2, transport.clone(), &settings);
        let rows = uploader.store.select_undelivered(10).unwrap();
        uploader.cycle().unwrap();

        let body = transport.bodies.lock().unwrap()[0].clone();
        let items: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["row_id"], rows[0].id);
        assert_eq!(items[0]["time"], rows[0].time);
        assert_eq!(items[0]["data"], rows[0].data.as_str());
        assert_eq!(items[0]["machine_uuid"], "machine-1");

        let embedded: serde_json::Value =
            serde_json::from_str(items[0]["settings"].as_str().unwrap()).unwrap();
        assert_eq!(embedded["client_version"], crate::VERSION);
        assert!(embedded.get("api_url").is_none());
        assert!(!body.windows(12).any(|w| w == b"secret-token"));
    }

    #[test]
    fn drain_stops_at_first_failure() {
        let transport = FakeTransport::replying(&[Ok(204), Ok(503)]);
        let (_dir, mut uploader) = uploader(25, transport.clone(), &Settings::default());
        assert_eq!(uploader.drain(FINAL_DRAIN_BATCHES).unwrap(), 10);
        assert_eq!(transport.posts(), 2);
        assert_eq!(pending(&uploader), 15);
    }

    #[test]
    fn failing_collector_is_not_hammered() {
        let transport = FakeTransport::replying(&[Ok(500), Ok(500), Ok(500)]);
        let settings = Settings {
            upload_delta: 30,
            ..Settings::default()
        };
        let (_dir, mut uploader) = uploader(12, transport.clone(), &settings);
        let shutdown = Shutdown::new();

        let started = Instant::now();
        thread::scope(|s| {
            s.spawn(|| uploader.run(&shutdown));
            thread::sleep(Duration::from_millis(300));
            shutdown.cancel(ShutdownReason::Interrupt);
        });

        assert!(started.elapsed() < Duration::from_secs(5));
        // one failed cycle, then one failed final drain attempt
        assert_eq!(transport.posts(), 2);
        assert_eq!(pending(&uploader), 12);
    }

    #[test]
    fn delivered_batches_are_sent_back_to_back() {
        let transport = FakeTransport::replying(&[Ok(204), Ok(204), Ok(204)]);
        let settings = Settings {
            upload_delta: 30,
            ..Settings::default()
        };
        let (_dir, mut uploader) = uploader(25, transport.clone(), &settings);
        let shutdown = Shutdown::new();

        thread::scope(|s| {
            s.spawn(|| uploader.run(&shutdown));
            thread::sleep(Duration::from_millis(300));
            shutdown.cancel(ShutdownReason::Interrupt);
        });

        assert_eq!(pending(&uploader), 0);
        // three deliveries, then the Idle cycle needs no request
        assert_eq!(transport.posts(), 3);
    }

    #[test]
    fn hung_request_trips_the_watchdog() {
        let (release, hold) = mpsc::channel();
        let (_dir, uploader) = uploader(1, HangingTransport { release: hold }, &Settings::default());

        let shutdown = Shutdown::new();
        let (expired_tx, expired) = mpsc::channel();
        let config = WatchdogConfig {
            poll: Duration::from_millis(10),
            grace: Duration::from_millis(50),
        };
        let watchdog = Watchdog::spawn(shutdown.clone(), config, move || {
            let _ = expired_tx.send(());
        })
        .unwrap();
        let mut uploader = uploader
            .with_watchdog(watchdog)
            .with_watchdog_limit(Duration::from_millis(50));

        thread::scope(|s| {
            let worker = s.spawn(|| uploader.cycle());
            expired.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(shutdown.reason(), Some(&ShutdownReason::Deadlock));

            release.send(()).unwrap();
            assert_eq!(worker.join().unwrap().unwrap(), CycleOutcome::Delivered(1));
        });
    }

    #[test]
    fn busy_store_postpones_instead_of_failing() {
        let transport = FakeTransport::replying(&[Ok(204)]);
        let settings = Settings {
            upload_delta: 30,
            ..Settings::default()
        };
        let (dir, mut uploader) = uploader(3, transport.clone(), &settings);
        uploader.store.set_busy_timeout(Duration::from_millis(20)).unwrap();

        let writer = crate::storage::store::open_connection(&dir.path().join("db.sqlite")).unwrap();
        writer.execute_batch("BEGIN IMMEDIATE").unwrap();

        let shutdown = Shutdown::new();
        thread::scope(|s| {
            s.spawn(|| uploader.run(&shutdown));
            thread::sleep(Duration::from_millis(300));
            assert!(!shutdown.is_cancelled());
            shutdown.cancel(ShutdownReason::Interrupt);
        });
        writer.execute_batch("ROLLBACK").unwrap();

        // delivered but not deleted: the rows go out again later
        assert_eq!(pending(&uploader), 3);
        // the delivered cycle, then the failed final drain
        assert_eq!(transport.posts(), 2);
    }
}
