//! Grid carbon intensity.
//!
//! Intensity (gCO2eq/kWh) is fetched from Electricity Maps and cached for
//! [`CACHE_TTL`]. A failed refresh falls back to the last known value, however
//! old, and the next attempt is held off for [`RETRY_AFTER`] so a broken
//! endpoint does not stall every sample.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::Settings;

pub const CACHE_TTL: Duration = Duration::from_secs(15 * 60);
pub const RETRY_AFTER: Duration = Duration::from_secs(60);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// milli-joules in one kWh
const MJ_PER_KWH: f64 = 3.6e9;

#[derive(Debug, thiserror::Error)]
pub enum CarbonError {
    #[error("carbon intensity request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("carbon intensity response has no value")]
    MissingValue,
}

/// Where intensity values come from.
pub trait IntensitySource: Send {
    fn fetch(&self) -> Result<f64, CarbonError>;
}

#[derive(Deserialize)]
struct LatestIntensity {
    #[serde(rename = "carbonIntensity")]
    carbon_intensity: Option<f64>,
}

/// Electricity Maps "latest carbon intensity" endpoint.
pub struct ElectricityMaps {
    client: reqwest::blocking::Client,
    url: String,
    token: String,
}

impl ElectricityMaps {
    pub fn new(url: &str, token: &str) -> Result<Self, CarbonError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.trim().to_string(),
            token: token.trim().to_string(),
        })
    }
}

impl IntensitySource for ElectricityMaps {
    fn fetch(&self) -> Result<f64, CarbonError> {
        let body: LatestIntensity = self
            .client
            .get(&self.url)
            .header("auth-token", &self.token)
            .send()?
            .error_for_status()?
            .json()?;
        body.carbon_intensity.ok_or(CarbonError::MissingValue)
    }
}

/// Cached intensity lookup.
pub struct GridIntensity {
    source: Box<dyn IntensitySource>,
    cached: Option<(f64, Instant)>,
    last_failure: Option<Instant>,
}

impl GridIntensity {
    pub fn new(source: Box<dyn IntensitySource>) -> Self {
        Self {
            source,
            cached: None,
            last_failure: None,
        }
    }

    /// Builds the Electricity Maps lookup. `None` when no token is configured,
    /// in which case no request is ever made.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        let token = settings.electricitymaps_token.as_deref()?.trim();
        if token.is_empty() {
            return None;
        }
        match ElectricityMaps::new(&settings.electricitymaps_url, token) {
            Ok(source) => Some(Self::new(Box::new(source))),
            Err(e) => {
                warn!(error = %e, "cannot build carbon intensity client");
                None
            }
        }
    }

    pub fn current(&mut self) -> Option<f64> {
        self.current_at(Instant::now())
    }

    fn current_at(&mut self, now: Instant) -> Option<f64> {
        let last_value = self.cached.map(|(value, _)| value);

        if let Some((value, fetched_at)) = self.cached
            && now.duration_since(fetched_at) < CACHE_TTL
        {
            return Some(value);
        }
        if let Some(failed_at) = self.last_failure
            && now.duration_since(failed_at) < RETRY_AFTER
        {
            return last_value;
        }

        match self.source.fetch() {
            Ok(value) => {
                debug!(intensity = value, "refreshed grid carbon intensity");
                self.cached = Some((value, now));
                self.last_failure = None;
                Some(value)
            }
            Err(e) => {
                warn!(error = %e, stale = ?last_value, "carbon intensity refresh failed");
                self.last_failure = Some(now);
                last_value
            }
        }
    }
}

/// Operational carbon (gCO2eq) of `combined_mj` at `intensity` gCO2eq/kWh.
pub fn operational_carbon_g(combined_mj: i64, intensity: f64) -> f64 {
    combined_mj as f64 / MJ_PER_KWH * intensity
}
