//! Data models shared by the collector, the store and the uploader.
//!
//! - [`Snapshot`]: one derived powermetrics sample, the unit that is encoded
//!   into the `measurements.data` column and shipped to the collector
//! - [`ProcessorReport`]: raw processor counters, tagged by hardware family
//! - [`ProcessSample`]: one ranked entry of the per-process list
//! - row types read back from SQLite ([`MeasurementRow`], [`SettingsRecord`],
//!   [`PowerTotals`], [`TableCounts`])
//!
//! All energy values are milli-joules.

use serde::{Deserialize, Serialize};

/// Processor counters as reported by powermetrics, before unit normalization.
///
/// The variant is chosen by the presence of `ane_energy` in the record: only
/// Apple silicon has a neural engine.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProcessorReport {
    Arm {
        /// Average combined power over the interval (mW).
        combined_power: f64,
        /// CPU energy over the interval (mJ).
        cpu_energy: f64,
        /// GPU energy over the interval (mJ).
        gpu_energy: f64,
        /// Neural engine energy over the interval (mJ).
        ane_energy: f64,
    },
    Intel {
        /// Package energy over the interval (J).
        package_joules: f64,
        /// CPU energy over the interval (J).
        cpu_joules: f64,
        /// Average integrated GPU power (W).
        igpu_watts: f64,
    },
}

/// One entry of the ranked per-process list.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ProcessSample {
    /// Process or coalition name; a command line after interpreter renaming.
    pub name: String,
    /// Task pid, or coalition id for coalitions.
    pub pid: Option<i64>,
    /// Energy impact accumulated over the interval
    /// (`energy_impact_per_s × elapsed_s`).
    pub energy_impact: f64,
    /// CPU time spent over the interval (ns).
    pub cputime_ns: i64,
    /// CPU time as a percentage of the interval, truncated.
    pub cputime_per: i64,
}

/// One derived sample.
///
/// Invariants: counters are non-negative and `elapsed_ns > 0`.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Snapshot {
    /// Sample time, UTC milliseconds since epoch.
    pub timestamp: i64,
    /// Length of the sampling interval (ns).
    pub elapsed_ns: u64,
    pub processor: ProcessorReport,
    pub combined_energy_mj: i64,
    pub cpu_energy_mj: i64,
    pub gpu_energy_mj: i64,
    pub ane_energy_mj: i64,
    /// Aggregate energy impact over the interval.
    pub energy_impact: f64,
    /// Top processes by energy impact, highest first.
    pub top_processes: Vec<ProcessSample>,
    pub hw_model: String,
    pub thermal_pressure: String,
    pub os_version: String,
    /// Grid carbon intensity at sample time (gCO2eq/kWh), if known.
    pub grid_intensity: Option<f64>,
    /// Operational carbon of the interval (gCO2eq), if intensity is known.
    pub co2eq_g: Option<f64>,
}

/// Row of the `measurements` table.
#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementRow {
    pub id: i64,
    pub time: i64,
    /// base64(zlib(JSON(Snapshot)))
    pub data: String,
}

/// Row of the `settings` table.
#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct SettingsRecord {
    pub id: i64,
    pub time: i64,
    pub machine_uuid: String,
    pub powermetrics: i64,
    pub upload_delta: i64,
    pub api_url: String,
    pub web_url: String,
    pub upload_data: bool,
    pub electricitymaps_token: Option<String>,
}

/// Result of [`crate::storage::Store::append_settings_if_changed`].
#[derive(Clone, Debug, PartialEq)]
pub struct StoredSettings {
    pub machine_uuid: String,
    /// Whether a new settings row was written.
    pub appended: bool,
}

/// Sums over `power_measurements`.
#[derive(Clone, Serialize, Debug, PartialEq, Default)]
pub struct PowerTotals {
    pub rows: i64,
    pub combined_energy_mj: i64,
    pub cpu_energy_mj: i64,
    pub gpu_energy_mj: i64,
    pub ane_energy_mj: i64,
    pub energy_impact: f64,
    pub co2eq_g: f64,
    pub first_time: Option<i64>,
    pub last_time: Option<i64>,
}

/// Row counts per table.
#[derive(Clone, Serialize, Debug, PartialEq, Default)]
pub struct TableCounts {
    pub measurements: i64,
    pub power_measurements: i64,
    pub top_processes: i64,
    pub settings: i64,
}
