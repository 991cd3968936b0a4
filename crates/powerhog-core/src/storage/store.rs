//! SQLite-backed measurement store.
//!
//! Every thread that touches the database opens its own [`Store`]. Connections
//! run in WAL mode with a busy timeout, so concurrent writers are serialized
//! by SQLite's own locking instead of an in-process mutex.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};
use uuid::Uuid;

use super::error::Result;
use super::model::{
    MeasurementRow, PowerTotals, SettingsRecord, Snapshot, StoredSettings, TableCounts,
};
use crate::config::Settings;

/// How long a connection waits on a locked database before failing.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Per-process energy impact summed over all stored rows.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct ProcessTotal {
    pub name: String,
    pub energy_impact: f64,
    pub samples: i64,
}

pub struct Store {
    pub(super) conn: Connection,
}

impl Store {
    /// Opens the database. The schema must already be in place
    /// (see [`super::ensure_schema`]).
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: open_connection(path)?,
        })
    }

    /// Overrides [`BUSY_TIMEOUT`] for this connection.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        Ok(self.conn.busy_timeout(timeout)?)
    }

    /// Writes the encoded measurement row and the derived power and
    /// top-process rows of one snapshot in a single transaction.
    ///
    /// Returns the id of the measurement row.
    pub fn append_snapshot(&mut self, encoded: &str, snapshot: &Snapshot) -> Result<i64> {
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO measurements (time, data, uploaded) VALUES (?1, ?2, 0)",
            params![snapshot.timestamp, encoded],
        )?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO power_measurements
                (time, combined_energy, cpu_energy, gpu_energy, ane_energy, energy_impact, co2eq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                snapshot.timestamp,
                snapshot.combined_energy_mj,
                snapshot.cpu_energy_mj,
                snapshot.gpu_energy_mj,
                snapshot.ane_energy_mj,
                snapshot.energy_impact,
                snapshot.co2eq_g,
            ],
        )?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO top_processes (time, name, energy_impact, cputime_per, samples)
                 VALUES (?1, ?2, ?3, ?4, 1)",
            )?;
            for process in &snapshot.top_processes {
                stmt.execute(params![
                    snapshot.timestamp,
                    process.name,
                    process.energy_impact,
                    process.cputime_per as f64,
                ])?;
            }
        }

        tx.commit()?;
        Ok(id)
    }

    /// Oldest measurement rows not yet delivered, at most `limit`.
    pub fn select_undelivered(&self, limit: usize) -> Result<Vec<MeasurementRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, time, data FROM measurements WHERE uploaded = 0 ORDER BY id LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(MeasurementRow {
                    id: row.get(0)?,
                    time: row.get(1)?,
                    data: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Removes measurement rows the collector has acknowledged.
    pub fn delete_delivered(&mut self, ids: &[i64]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM measurements WHERE id = ?1")?;
            for id in ids {
                deleted += stmt.execute([id])?;
            }
        }
        tx.commit()?;
        debug!(deleted, "deleted delivered measurements");
        Ok(deleted)
    }

    pub fn latest_settings(&self) -> Result<Option<SettingsRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, time, machine_uuid, powermetrics, upload_delta, api_url, web_url,
                        upload_data, electricitymaps_token
                 FROM settings ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(SettingsRecord {
                        id: row.get(0)?,
                        time: row.get(1)?,
                        machine_uuid: row.get(2)?,
                        powermetrics: row.get(3)?,
                        upload_delta: row.get(4)?,
                        api_url: row.get(5)?,
                        web_url: row.get(6)?,
                        upload_data: row.get(7)?,
                        electricitymaps_token: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Records the effective settings if they differ from the latest stored
    /// row. The machine id is generated on first use and reused afterwards.
    pub fn append_settings_if_changed(&mut self, settings: &Settings) -> Result<StoredSettings> {
        let latest = self.latest_settings()?;

        let api_url = settings.api_url.trim();
        let web_url = settings.web_url.trim();
        let token = settings.electricitymaps_token.as_deref();

        if let Some(latest) = &latest {
            let unchanged = latest.powermetrics == settings.powermetrics as i64
                && latest.upload_delta == settings.upload_delta as i64
                && latest.api_url == api_url
                && latest.web_url == web_url
                && latest.upload_data == settings.upload_data
                && latest.electricitymaps_token.as_deref() == token;
            if unchanged {
                return Ok(StoredSettings {
                    machine_uuid: latest.machine_uuid.clone(),
                    appended: false,
                });
            }
        }

        let machine_uuid = match latest {
            Some(latest) => latest.machine_uuid,
            None => {
                let uuid = Uuid::new_v4().to_string();
                info!(machine_uuid = %uuid, "generated machine id");
                uuid
            }
        };

        self.conn.execute(
            "INSERT INTO settings
                (time, machine_uuid, powermetrics, upload_delta, api_url, web_url,
                 upload_data, electricitymaps_token)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                Utc::now().timestamp_millis(),
                machine_uuid,
                settings.powermetrics as i64,
                settings.upload_delta as i64,
                api_url,
                web_url,
                settings.upload_data,
                token,
            ],
        )?;

        Ok(StoredSettings {
            machine_uuid,
            appended: true,
        })
    }

    /// Time of the newest stored sample, if any.
    pub fn latest_sample_time(&self) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row("SELECT MAX(time) FROM power_measurements", [], |row| {
                row.get(0)
            })?)
    }

    pub fn power_totals(&self) -> Result<PowerTotals> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(combined_energy), 0),
                    COALESCE(SUM(cpu_energy), 0),
                    COALESCE(SUM(gpu_energy), 0),
                    COALESCE(SUM(ane_energy), 0),
                    COALESCE(SUM(energy_impact), 0.0),
                    COALESCE(SUM(co2eq), 0.0),
                    MIN(time),
                    MAX(time)
             FROM power_measurements",
            [],
            |row| {
                Ok(PowerTotals {
                    rows: row.get(0)?,
                    combined_energy_mj: row.get(1)?,
                    cpu_energy_mj: row.get(2)?,
                    gpu_energy_mj: row.get(3)?,
                    ane_energy_mj: row.get(4)?,
                    energy_impact: row.get(5)?,
                    co2eq_g: row.get(6)?,
                    first_time: row.get(7)?,
                    last_time: row.get(8)?,
                })
            },
        )?)
    }

    /// Processes with the highest summed energy impact.
    pub fn top_process_totals(&self, limit: usize) -> Result<Vec<ProcessTotal>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, SUM(energy_impact), SUM(samples)
             FROM top_processes
             GROUP BY name
             ORDER BY SUM(energy_impact) DESC, name
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(ProcessTotal {
                    name: row.get(0)?,
                    energy_impact: row.get(1)?,
                    samples: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn counts(&self) -> Result<TableCounts> {
        let count = |table: &str| -> rusqlite::Result<i64> {
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        };
        Ok(TableCounts {
            measurements: count("measurements")?,
            power_measurements: count("power_measurements")?,
            top_processes: count("top_processes")?,
            settings: count("settings")?,
        })
    }
}
