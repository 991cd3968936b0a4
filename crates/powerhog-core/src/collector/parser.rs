//! powermetrics plist record parser.
//!
//! Turns one complete record (see [`super::reassembler`]) into a [`Record`].
//! Only the keys the deriver needs are modelled; everything else in the
//! document is ignored. Malformed documents are a hard error: the raw text
//! is logged for postmortem and the error is propagated, no partial recovery.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::SystemTime;
use tracing::error;

/// Message powermetrics prints when started without root.
pub const PRIVILEGE_MESSAGE: &str = "powermetrics must be invoked as the superuser";

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("powermetrics needs to run as root")]
    InsufficientPrivilege,
    #[error("malformed powermetrics record: {0}")]
    Malformed(#[from] plist::Error),
    #[error("powermetrics record has no timestamp")]
    MissingTimestamp,
}

/// `processor` dictionary. Apple silicon reports `ane_energy` and friends,
/// Intel machines the `*_joules` / `*_watts` keys.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawProcessor {
    pub combined_power: Option<f64>,
    pub cpu_energy: Option<f64>,
    pub gpu_energy: Option<f64>,
    pub ane_energy: Option<f64>,
    pub package_joules: Option<f64>,
    pub cpu_joules: Option<f64>,
    pub igpu_watts: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawAllTasks {
    pub energy_impact: f64,
    pub energy_impact_per_s: f64,
}

/// A coalition or a task inside a coalition.
///
/// Coalitions carry a coalition `id`, tasks a process `pid`. The two number
/// spaces are unrelated, so only `pid` may be used to look up a process.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawEntry {
    pub pid: Option<i64>,
    #[serde(rename = "id")]
    pub coalition_id: Option<i64>,
    pub name: String,
    pub energy_impact: f64,
    pub energy_impact_per_s: f64,
    pub cputime_ns: f64,
    pub cputime_ms_per_s: f64,
    pub tasks: Vec<RawEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawRecord {
    timestamp: Option<plist::Date>,
    elapsed_ns: u64,
    hw_model: String,
    kern_osversion: String,
    thermal_pressure: String,
    processor: RawProcessor,
    all_tasks: RawAllTasks,
    coalitions: Vec<RawEntry>,
}

/// One parsed sample, before derivation.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// UTC milliseconds since epoch.
    pub timestamp: i64,
    pub elapsed_ns: u64,
    pub hw_model: String,
    pub os_version: String,
    pub thermal_pressure: String,
    pub processor: RawProcessor,
    pub all_tasks: RawAllTasks,
    pub coalitions: Vec<RawEntry>,
}

/// Parses one reassembled record.
pub fn parse_record(text: &str) -> Result<Record, ParseError> {
    let trimmed = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    if trimmed.starts_with(PRIVILEGE_MESSAGE) {
        return Err(ParseError::InsufficientPrivilege);
    }

    let raw: RawRecord = match plist::from_bytes(trimmed.as_bytes()) {
        Ok(raw) => raw,
        Err(e) => {
            error!(error = %e, raw = %text, "malformed powermetrics record");
            return Err(ParseError::Malformed(e));
        }
    };

    let Some(date) = raw.timestamp else {
        error!(raw = %text, "powermetrics record without timestamp");
        return Err(ParseError::MissingTimestamp);
    };

    Ok(Record {
        timestamp: epoch_millis(date),
        elapsed_ns: raw.elapsed_ns,
        hw_model: raw.hw_model,
        os_version: raw.kern_osversion,
        thermal_pressure: raw.thermal_pressure,
        processor: raw.processor,
        all_tasks: raw.all_tasks,
        coalitions: raw.coalitions,
    })
}

fn epoch_millis(date: plist::Date) -> i64 {
    let time: SystemTime = date.into();
    DateTime::<Utc>::from(time).timestamp_millis()
}
