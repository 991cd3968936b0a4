//! Schema migrations.
//!
//! Migrations are embedded in the binary and identified by consecutive
//! versions starting at 1. The applied version lives in `PRAGMA user_version`.
//! [`ensure_schema`] walks forward or backward one step at a time, each step in
//! its own transaction, so an interrupted run leaves the database at the last
//! fully applied version.
//!
//! [`ensure_schema`] also puts the file into incremental auto-vacuum mode, so
//! that space freed by rollup can be reclaimed in small steps later.

use std::path::Path;

use rusqlite::Connection;
use tracing::info;

use super::error::{Result, StorageError};
use super::store::open_connection;

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial tables",
        up: "
            CREATE TABLE IF NOT EXISTS measurements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                time INTEGER NOT NULL,
                data TEXT NOT NULL,
                uploaded INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS power_measurements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                time INTEGER NOT NULL,
                combined_energy INTEGER NOT NULL,
                cpu_energy INTEGER NOT NULL,
                gpu_energy INTEGER NOT NULL,
                ane_energy INTEGER NOT NULL,
                energy_impact REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS top_processes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                time INTEGER NOT NULL,
                name TEXT NOT NULL,
                energy_impact REAL NOT NULL,
                cputime_per REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS settings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                time INTEGER NOT NULL,
                machine_uuid TEXT NOT NULL,
                powermetrics INTEGER NOT NULL,
                upload_delta INTEGER NOT NULL,
                api_url TEXT NOT NULL,
                web_url TEXT NOT NULL,
                upload_data INTEGER NOT NULL
            );
        ",
        down: "
            DROP TABLE IF EXISTS measurements;
            DROP TABLE IF EXISTS power_measurements;
            DROP TABLE IF EXISTS top_processes;
            DROP TABLE IF EXISTS settings;
        ",
    },
    Migration {
        version: 2,
        name: "carbon, rollup weights, time indexes",
        up: "
            ALTER TABLE power_measurements ADD COLUMN co2eq REAL;
            ALTER TABLE top_processes ADD COLUMN samples INTEGER NOT NULL DEFAULT 1;
            ALTER TABLE settings ADD COLUMN electricitymaps_token TEXT;
            CREATE INDEX IF NOT EXISTS idx_power_measurements_time ON power_measurements(time);
            CREATE INDEX IF NOT EXISTS idx_top_processes_time ON top_processes(time);
        ",
        down: "
            DROP INDEX IF EXISTS idx_power_measurements_time;
            DROP INDEX IF EXISTS idx_top_processes_time;
            ALTER TABLE settings DROP COLUMN electricitymaps_token;
            ALTER TABLE top_processes DROP COLUMN samples;
            ALTER TABLE power_measurements DROP COLUMN co2eq;
        ",
    },
    Migration {
        version: 3,
        name: "delete delivered measurements",
        up: "
            DELETE FROM measurements WHERE uploaded != 0;
            CREATE INDEX IF NOT EXISTS idx_measurements_uploaded ON measurements(uploaded, id);
        ",
        down: "
            DROP INDEX IF EXISTS idx_measurements_uploaded;
        ",
    },
];

/// Schema version this build reads and writes.
pub const CURRENT_VERSION: i64 = 3;

/// `PRAGMA auto_vacuum` value of incremental mode.
pub(crate) const AUTO_VACUUM_INCREMENTAL: i64 = 2;

pub fn schema_version(conn: &Connection) -> Result<i64> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Brings the database at `path` to `target` version, creating it if needed.
///
/// Returns the version the database was at before the call.
///
/// Runs before any worker opens the database: switching the vacuum mode of
/// an existing file needs one full `VACUUM`.
pub fn ensure_schema(path: &Path, target: i64) -> Result<i64> {
    let mut conn = open_connection(path)?;
    if enable_incremental_vacuum(&conn)? {
        info!("switched database to incremental vacuum");
    }
    migrate(&mut conn, target)
}

/// Returns `true` if the mode had to be changed.
pub(crate) fn enable_incremental_vacuum(conn: &Connection) -> Result<bool> {
    let mode: i64 = conn.pragma_query_value(None, "auto_vacuum", |row| row.get(0))?;
    if mode == AUTO_VACUUM_INCREMENTAL {
        return Ok(false);
    }
    conn.execute_batch("PRAGMA auto_vacuum = INCREMENTAL; VACUUM;")?;
    Ok(true)
}

pub fn migrate(conn: &mut Connection, target: i64) -> Result<i64> {
    let supported = MIGRATIONS.last().map_or(0, |m| m.version);
    let start = schema_version(conn)?;
    if start > supported {
        return Err(StorageError::UnknownSchemaVersion {
            found: start,
            supported,
        });
    }
    if target > supported || target < 0 {
        return Err(StorageError::UnknownSchemaVersion {
            found: target,
            supported,
        });
    }

    let mut version = start;
    while version < target {
        let migration = &MIGRATIONS[version as usize];
        apply(conn, version, migration.version, migration.up)?;
        info!(version = migration.version, name = migration.name, "applied migration");
        version = migration.version;
    }
    while version > target {
        let migration = &MIGRATIONS[(version - 1) as usize];
        apply(conn, version, migration.version - 1, migration.down)?;
        info!(version = migration.version, name = migration.name, "reverted migration");
        version = migration.version - 1;
    }
    Ok(start)
}

fn apply(conn: &mut Connection, from: i64, to: i64, sql: &str) -> Result<()> {
    let step = |conn: &mut Connection| -> rusqlite::Result<()> {
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", to)?;
        tx.commit()
    };
    step(conn).map_err(|source| StorageError::Migration { from, to, source })
}
