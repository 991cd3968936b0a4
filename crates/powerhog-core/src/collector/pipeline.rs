//! The collection loop: source → reassembler → parser → deriver → store.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::derive::{DeriveError, Deriver};
use super::parser::{ParseError, parse_record};
use super::reassembler::Reassembler;
use super::source::{ChunkSource, Poll, SourceError};
use crate::runtime::{ExitStatus, Shutdown, ShutdownReason, Stats};
use crate::storage::model::Snapshot;
use crate::storage::{StorageError, Store, encode_snapshot};

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Derive(#[from] DeriveError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl CollectError {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            CollectError::Parse(ParseError::InsufficientPrivilege) => ExitStatus::MissingPrivilege,
            _ => ExitStatus::Fatal,
        }
    }
}

/// How long a locked database is retried before the append fails.
pub const BUSY_DEADLINE: Duration = Duration::from_secs(5 * 60);

const BUSY_RETRY_PAUSE: Duration = Duration::from_millis(250);

/// Per-record processing: parse, derive, encode, store.
pub struct Pipeline {
    deriver: Deriver,
    store: Store,
    stats: Arc<Stats>,
    busy_deadline: Duration,
}

impl Pipeline {
    pub fn new(deriver: Deriver, store: Store, stats: Arc<Stats>) -> Self {
        Self {
            deriver,
            store,
            stats,
            busy_deadline: BUSY_DEADLINE,
        }
    }

    pub fn with_busy_deadline(mut self, deadline: Duration) -> Self {
        self.busy_deadline = deadline;
        self
    }

    /// Processes one complete record.
    ///
    /// Returns `None` when the sample was skipped (zero-length interval).
    pub fn ingest(&mut self, text: &str) -> Result<Option<Snapshot>, CollectError> {
        let record = parse_record(text)?;
        let timestamp = record.timestamp;

        let snapshot = match self.deriver.derive(record) {
            Ok(snapshot) => snapshot,
            Err(DeriveError::ZeroInterval) => {
                warn!(timestamp, "skipping sample with zero-length interval");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let encoded = encode_snapshot(&snapshot)?;
        let id = self.append(&encoded, &snapshot)?;
        self.stats.record_snapshot(&snapshot);

        debug!(
            id,
            timestamp,
            combined_mj = snapshot.combined_energy_mj,
            energy_impact = snapshot.energy_impact,
            processes = snapshot.top_processes.len(),
            "stored sample"
        );
        Ok(Some(snapshot))
    }

    /// Appends one snapshot, waiting out other writers (rollup, upload)
    /// until [`Pipeline::with_busy_deadline`] has passed.
    fn append(&mut self, encoded: &str, snapshot: &Snapshot) -> Result<i64, StorageError> {
        let started = Instant::now();
        loop {
            match self.store.append_snapshot(encoded, snapshot) {
                Err(e) if e.is_busy() && started.elapsed() < self.busy_deadline => {
                    warn!(
                        timestamp = snapshot.timestamp,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "database busy, retrying append"
                    );
                    thread::sleep(BUSY_RETRY_PAUSE);
                }
                result => return result,
            }
        }
    }
}

/// Runs until the source ends or shutdown is requested.
///
/// A finite source that reaches its end raises [`ShutdownReason::EndOfInput`].
/// A live source that closes while no shutdown was requested is an error.
/// Returns the number of stored samples.
pub fn run_collection(
    source: &mut dyn ChunkSource,
    pipeline: &mut Pipeline,
    shutdown: &Shutdown,
    mut on_snapshot: impl FnMut(&Snapshot),
) -> Result<u64, CollectError> {
    let mut reassembler = Reassembler::new();
    let mut stored = 0u64;

    let mut ingest_all = |records: Vec<String>, stored: &mut u64| -> Result<(), CollectError> {
        for record in records {
            if let Some(snapshot) = pipeline.ingest(&record)? {
                *stored += 1;
                on_snapshot(&snapshot);
            }
        }
        Ok(())
    };

    while !shutdown.is_cancelled() {
        match source.next_chunk()? {
            Poll::Data(chunk) => ingest_all(reassembler.feed(&chunk), &mut stored)?,
            Poll::Idle => debug!("no measurement output yet"),
            Poll::Closed => {
                ingest_all(reassembler.finish(), &mut stored)?;
                if source.is_finite() {
                    info!(stored, "input fully processed");
                    shutdown.cancel(ShutdownReason::EndOfInput);
                    break;
                }
                if shutdown.is_cancelled() {
                    break;
                }
                return Err(SourceError::PrematureClose.into());
            }
        }
    }

    if reassembler.has_pending() {
        debug!("discarding incomplete record at shutdown");
    }
    Ok(stored)
}
