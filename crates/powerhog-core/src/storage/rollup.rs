//! Rollup of old detail rows into daily rows.
//!
//! Power and top-process rows older than the retention horizon are replaced by
//! one row per UTC day (and per process name for top processes). Sums are
//! preserved exactly; the CPU-time percentage becomes a sample-weighted
//! average, with the weight carried in the `samples` column so that rolling up
//! already rolled-up rows changes nothing.
//!
//! Freed pages are handed back with `PRAGMA incremental_vacuum` in small
//! steps. A full `VACUUM` would hold the write lock for as long as it takes to
//! rewrite the whole file, stalling the collection loop behind it.

use std::thread;
use std::time::Duration;

use rusqlite::{Transaction, params};
use tracing::{debug, error, info, warn};

use super::error::Result;
use super::store::Store;
use crate::runtime::{Shutdown, ShutdownReason, Stats, Tick};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Interval between rollup runs.
pub const ROLLUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Pages released per incremental vacuum step.
pub const VACUUM_STEP_PAGES: i64 = 1024;

/// Pause between vacuum steps so waiting writers get the lock.
const VACUUM_STEP_PAUSE: Duration = Duration::from_millis(20);

/// Row counts before and after a rollup run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RollupResult {
    pub power_rows_before: usize,
    pub power_rows_after: usize,
    pub process_rows_before: usize,
    pub process_rows_after: usize,
    /// Free pages returned to the file system after the commit.
    pub pages_reclaimed: i64,
}

impl RollupResult {
    pub fn rows_removed(&self) -> usize {
        (self.power_rows_before - self.power_rows_after)
            + (self.process_rows_before - self.process_rows_after)
    }
}

struct PowerDay {
    day: i64,
    combined: i64,
    cpu: i64,
    gpu: i64,
    ane: i64,
    energy_impact: f64,
    co2eq: Option<f64>,
    rows: usize,
}

struct ProcessDay {
    day: i64,
    name: String,
    energy_impact: f64,
    cputime_per: f64,
    samples: i64,
    rows: usize,
}

impl Store {
    /// Replaces rows with `time < cutoff_ms` by per-day aggregates.
    pub fn rollup_older_than(&mut self, cutoff_ms: i64) -> Result<RollupResult> {
        let tx = self.conn.transaction()?;

        let power = aggregate_power(&tx, cutoff_ms)?;
        let processes = aggregate_processes(&tx, cutoff_ms)?;

        let mut result = RollupResult {
            power_rows_before: power.iter().map(|d| d.rows).sum(),
            power_rows_after: power.len(),
            process_rows_before: processes.iter().map(|d| d.rows).sum(),
            process_rows_after: processes.len(),
            pages_reclaimed: 0,
        };

        tx.execute(
            "DELETE FROM power_measurements WHERE time < ?1",
            [cutoff_ms],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO power_measurements
                    (time, combined_energy, cpu_energy, gpu_energy, ane_energy, energy_impact, co2eq)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for d in &power {
                insert.execute(params![
                    d.day,
                    d.combined,
                    d.cpu,
                    d.gpu,
                    d.ane,
                    d.energy_impact,
                    d.co2eq
                ])?;
            }
        }

        tx.execute("DELETE FROM top_processes WHERE time < ?1", [cutoff_ms])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO top_processes (time, name, energy_impact, cputime_per, samples)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for d in &processes {
                insert.execute(params![
                    d.day,
                    d.name,
                    d.energy_impact,
                    d.cputime_per,
                    d.samples
                ])?;
            }
        }

        tx.commit()?;

        if result.rows_removed() > 0 {
            result.pages_reclaimed = self.reclaim_free_pages();
        }

        Ok(result)
    }

    /// Number of unused pages in the database file.
    pub fn free_pages(&self) -> Result<i64> {
        Ok(self
            .conn
            .pragma_query_value(None, "freelist_count", |row| row.get(0))?)
    }

    /// Returns free pages to the file system, [`VACUUM_STEP_PAGES`] at a time.
    /// Each step is a separate write. Whatever is left after a failed step
    /// waits for the next run.
    fn reclaim_free_pages(&self) -> i64 {
        let step = format!("PRAGMA incremental_vacuum({VACUUM_STEP_PAGES})");
        let mut reclaimed = 0;
        loop {
            let before = match self.free_pages() {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "cannot read free page count");
                    break;
                }
            };
            if let Err(e) = self.conn.execute_batch(&step) {
                warn!(error = %e, "incremental vacuum step failed");
                break;
            }
            let after = match self.free_pages() {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "cannot read free page count");
                    break;
                }
            };
            // no progress: the file is not in incremental mode
            if after >= before {
                break;
            }
            reclaimed += before - after;
            thread::sleep(VACUUM_STEP_PAUSE);
        }
        reclaimed
    }
}

fn aggregate_power(tx: &Transaction<'_>, cutoff_ms: i64) -> Result<Vec<PowerDay>> {
    let mut stmt = tx.prepare(
        "SELECT (time / ?2) * ?2 AS day,
                SUM(combined_energy), SUM(cpu_energy), SUM(gpu_energy), SUM(ane_energy),
                SUM(energy_impact), SUM(co2eq), COUNT(*)
         FROM power_measurements
         WHERE time < ?1
         GROUP BY day
         ORDER BY day",
    )?;
    let days = stmt
        .query_map(params![cutoff_ms, DAY_MS], |row| {
            Ok(PowerDay {
                day: row.get(0)?,
                combined: row.get(1)?,
                cpu: row.get(2)?,
                gpu: row.get(3)?,
                ane: row.get(4)?,
                energy_impact: row.get(5)?,
                co2eq: row.get(6)?,
                rows: row.get::<_, i64>(7)? as usize,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(days)
}

fn aggregate_processes(tx: &Transaction<'_>, cutoff_ms: i64) -> Result<Vec<ProcessDay>> {
    let mut stmt = tx.prepare(
        "SELECT (time / ?2) * ?2 AS day, name,
                SUM(energy_impact),
                SUM(cputime_per * samples) / SUM(samples),
                SUM(samples), COUNT(*)
         FROM top_processes
         WHERE time < ?1
         GROUP BY day, name
         ORDER BY day, name",
    )?;
    let days = stmt
        .query_map(params![cutoff_ms, DAY_MS], |row| {
            Ok(ProcessDay {
                day: row.get(0)?,
                name: row.get(1)?,
                energy_impact: row.get(2)?,
                cputime_per: row.get(3)?,
                samples: row.get(4)?,
                rows: row.get::<_, i64>(5)? as usize,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(days)
}

/// Rollup worker body: runs once immediately, then every [`ROLLUP_INTERVAL`].
///
/// `after_run` is invoked after every successful run (the daemon uses it to
/// hand freed memory back to the OS).
pub fn run_rollup_loop(
    mut store: Store,
    retention: Duration,
    tick: &Tick,
    shutdown: &Shutdown,
    stats: &Stats,
    mut after_run: impl FnMut(),
) {
    loop {
        let cutoff = tick.now_ms() - retention.as_millis() as i64;
        match store.rollup_older_than(cutoff) {
            Ok(result) => {
                stats.record_rollup();
                if result.rows_removed() > 0 {
                    info!(
                        power_rows = result.power_rows_before,
                        power_days = result.power_rows_after,
                        process_rows = result.process_rows_before,
                        process_days = result.process_rows_after,
                        pages_reclaimed = result.pages_reclaimed,
                        "rolled up old measurements"
                    );
                } else {
                    debug!("nothing to roll up");
                }
                after_run();
            }
            Err(e) if e.is_busy() => {
                warn!(error = %e, "database busy, rollup postponed to the next run");
            }
            Err(e) => {
                error!(error = %e, "rollup failed");
                shutdown.cancel(ShutdownReason::Fatal(format!("rollup failed: {e}")));
                return;
            }
        }

        if !shutdown.sleep(ROLLUP_INTERVAL) {
            break;
        }
    }
    debug!("rollup worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::tests::sample_snapshot;
    use crate::storage::model::ProcessSample;
    use crate::storage::store::tests::{append, temp_store};

    const DAY1: i64 = 1_694_304_000_000; // 2023-09-10T00:00:00Z

    fn snapshot_at(time: i64, combined: i64, processes: &[(&str, f64, i64)]) -> crate::storage::Snapshot {
        let mut snapshot = sample_snapshot();
        snapshot.timestamp = time;
        snapshot.combined_energy_mj = combined;
        snapshot.cpu_energy_mj = combined / 2;
        snapshot.energy_impact = combined as f64 / 10.0;
        snapshot.co2eq_g = Some(0.5);
        snapshot.top_processes = processes
            .iter()
            .map(|&(name, energy_impact, cputime_per)| ProcessSample {
                name: name.into(),
                pid: None,
                energy_impact,
                cputime_ns: 0,
                cputime_per,
            })
            .collect();
        snapshot
    }

    fn seed(store: &mut Store) {
        let hour = 60 * 60 * 1000;
        append(store, &snapshot_at(DAY1 + hour, 100, &[("a", 1.0, 10), ("b", 2.0, 20)]));
        append(store, &snapshot_at(DAY1 + 2 * hour, 300, &[("a", 3.0, 30)]));
        append(store, &snapshot_at(DAY1 + DAY_MS + hour, 50, &[("a", 5.0, 50)]));
        // newer than the cutoff used below
        append(store, &snapshot_at(DAY1 + 3 * DAY_MS, 20, &[("c", 1.0, 1)]));
    }

    #[test]
    fn rollup_preserves_sums() {
        let (_dir, _path, mut store) = temp_store();
        seed(&mut store);
        let before = store.power_totals().unwrap();

        let result = store.rollup_older_than(DAY1 + 2 * DAY_MS).unwrap();
        assert_eq!(result.power_rows_before, 3);
        assert_eq!(result.power_rows_after, 2);
        assert_eq!(result.process_rows_before, 4);
        // (day1, a), (day1, b), (day2, a)
        assert_eq!(result.process_rows_after, 3);

        let after = store.power_totals().unwrap();
        assert_eq!(after.rows, 3);
        assert_eq!(after.combined_energy_mj, before.combined_energy_mj);
        assert_eq!(after.cpu_energy_mj, before.cpu_energy_mj);
        assert_eq!(after.energy_impact, before.energy_impact);
        assert_eq!(after.co2eq_g, before.co2eq_g);
        assert_eq!(after.first_time, Some(DAY1));
    }

    #[test]
    fn rollup_weights_cpu_share_by_samples() {
        let (_dir, _path, mut store) = temp_store();
        seed(&mut store);
        store.rollup_older_than(DAY1 + 2 * DAY_MS).unwrap();

        let (energy, cputime, samples): (f64, f64, i64) = store
            .conn
            .query_row(
                "SELECT energy_impact, cputime_per, samples FROM top_processes
                 WHERE time = ?1 AND name = 'a'",
                [DAY1],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(energy, 4.0);
        assert_eq!(cputime, 20.0);
        assert_eq!(samples, 2);
    }

    #[test]
    fn rollup_is_idempotent() {
        let (_dir, _path, mut store) = temp_store();
        seed(&mut store);
        let cutoff = DAY1 + 2 * DAY_MS;

        store.rollup_older_than(cutoff).unwrap();
        let totals = store.power_totals().unwrap();
        let counts = store.counts().unwrap();
        let processes = store.top_process_totals(10).unwrap();

        let second = store.rollup_older_than(cutoff).unwrap();
        assert_eq!(second.rows_removed(), 0);
        assert_eq!(second.pages_reclaimed, 0);
        assert_eq!(store.power_totals().unwrap(), totals);
        assert_eq!(store.counts().unwrap(), counts);
        assert_eq!(store.top_process_totals(10).unwrap(), processes);
    }

    #[test]
    fn measurement_rows_are_untouched() {
        let (_dir, _path, mut store) = temp_store();
        seed(&mut store);
        store.rollup_older_than(DAY1 + 2 * DAY_MS).unwrap();
        assert_eq!(store.counts().unwrap().measurements, 4);
    }

    #[test]
    fn freed_pages_are_reclaimed_in_steps() {
        let (_dir, _path, mut store) = temp_store();
        let minute = 60 * 1000;
        let names: Vec<String> = (0..5)
            .map(|i| format!("/Applications/Some Rather Long Application Name {i}.app/Contents"))
            .collect();
        for i in 0..400 {
            let processes: Vec<_> = names.iter().map(|n| (n.as_str(), 1.0, 10)).collect();
            append(&mut store, &snapshot_at(DAY1 + i * minute, 100, &processes));
        }

        let result = store.rollup_older_than(DAY1 + 2 * DAY_MS).unwrap();
        assert_eq!(result.power_rows_after, 1);
        assert_eq!(result.process_rows_after, 5);
        assert!(result.pages_reclaimed > 0);
        assert_eq!(store.free_pages().unwrap(), 0);
    }

    #[test]
    fn busy_database_postpones_the_run() {
        let (_dir, path, mut store) = temp_store();
        seed(&mut store);
        store.set_busy_timeout(Duration::from_millis(20)).unwrap();

        let writer = crate::storage::store::open_connection(&path).unwrap();
        writer.execute_batch("BEGIN IMMEDIATE").unwrap();

        let err = store.rollup_older_than(DAY1 + 2 * DAY_MS).unwrap_err();
        assert!(err.is_busy());

        let tick = Tick::new();
        tick.set(DAY1 + 9 * DAY_MS);
        let shutdown = Shutdown::new();
        let worker = {
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                let retention = Duration::from_secs(7 * 24 * 3600);
                run_rollup_loop(store, retention, &tick, &shutdown, &Stats::new(), || {});
            })
        };
        thread::sleep(Duration::from_millis(300));
        // the failed run did not bring the daemon down
        assert!(!shutdown.is_cancelled());

        shutdown.cancel(ShutdownReason::Interrupt);
        worker.join().unwrap();
        writer.execute_batch("COMMIT").unwrap();
    }

    #[test]
    fn loop_runs_once_and_stops_on_shutdown() {
        let (_dir, _path, mut store) = temp_store();
        seed(&mut store);

        let tick = Tick::new();
        tick.set(DAY1 + 9 * DAY_MS);
        let shutdown = Shutdown::new();
        let stats = Stats::new();
        let mut runs = 0;
        run_rollup_loop(store, Duration::from_secs(7 * 24 * 3600), &tick, &shutdown, &stats, || {
            runs += 1;
            shutdown.cancel(ShutdownReason::Interrupt);
        });
        assert_eq!(runs, 1);
        assert_eq!(stats.snapshot().rollups, 1);
    }
}
