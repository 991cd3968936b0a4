//! Measurement storage.
//!
//! - [`store`]: SQLite tables for raw measurements, derived power and
//!   top-process rows, and the settings history
//! - [`codec`]: wire encoding of a [`Snapshot`] into the `measurements.data` column
//! - [`migrations`]: embedded schema migrations tracked by `PRAGMA user_version`
//! - [`rollup`]: daily aggregation of rows past the retention horizon
//!
//! ```text
//! Snapshot ──encode──► measurements (id, time, data, uploaded)   ──► upload, then delete
//!     │
//!     └──derive──────► power_measurements (time, energies, impact, co2eq)   ──► rollup
//!                      top_processes (time, name, impact, cputime_per, samples)
//! ```

pub mod codec;
pub mod error;
pub mod migrations;
pub mod model;
pub mod rollup;
pub mod store;

pub use codec::{decode_snapshot, encode_snapshot};
pub use error::StorageError;
pub use migrations::{CURRENT_VERSION, ensure_schema};
pub use model::{
    MeasurementRow, PowerTotals, ProcessSample, ProcessorReport, SettingsRecord, Snapshot,
    StoredSettings, TableCounts,
};
pub use rollup::{RollupResult, run_rollup_loop};
pub use store::{ProcessTotal, Store};
