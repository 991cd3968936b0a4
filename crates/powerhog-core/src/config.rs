//! Effective daemon settings.
//!
//! Settings come from built-in defaults, optionally overlaid by a TOML settings
//! file, and finally by command-line flags (applied by the daemon binary).
//! The resolved [`Settings`] value is built once at startup and handed to every
//! worker; nothing mutates it afterwards.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name of the per-user settings file looked up in the home directory.
pub const SETTINGS_FILE_NAME: &str = ".hog_settings.toml";

/// Longest accepted powermetrics interval: one hour.
pub const MAX_INTERVAL_MS: u64 = 60 * 60 * 1000;

/// Longest accepted pause between upload cycles: one day.
pub const MAX_UPLOAD_DELTA_SECS: u64 = 24 * 60 * 60;

/// Error type for settings loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// powermetrics sampling interval in milliseconds.
    pub powermetrics: u64,
    /// Seconds between upload attempts when idle or after a failure.
    pub upload_delta: u64,
    pub api_url: String,
    pub web_url: String,
    pub upload_data: bool,
    /// Electricity Maps API token. Without it no grid intensity is looked up.
    pub electricitymaps_token: Option<String>,
    pub electricitymaps_url: String,
    /// Coalitions that wrap shell-spawned children and must be flattened.
    pub shell_coalitions: Vec<String>,
    /// Replace generic interpreter names with their command line.
    pub rename_interpreters: bool,
    /// Detail rows older than this many days are rolled up into daily rows.
    pub retention_days: u32,
    /// Lower bound for the liveness check period, in seconds.
    pub initial_grace_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            powermetrics: 5000,
            upload_delta: 300,
            api_url: "https://api.green-coding.berlin/v1/hog/add".to_string(),
            web_url: "http://metrics.green-coding.berlin/hog-details.html?machine_uuid=".to_string(),
            upload_data: true,
            electricitymaps_token: None,
            electricitymaps_url: "https://api.electricitymap.org/v3/carbon-intensity/latest"
                .to_string(),
            shell_coalitions: vec![
                "com.googlecode.iterm2".to_string(),
                "com.apple.Terminal".to_string(),
            ],
            rename_interpreters: false,
            retention_days: 7,
            initial_grace_secs: 60,
        }
    }
}

/// Settings embedded in every uploaded item.
///
/// Endpoint URLs and tokens are left out on purpose; the collector has no use for them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadedSettings {
    pub powermetrics: u64,
    pub upload_delta: u64,
    pub upload_data: bool,
    pub client_version: String,
}

impl Settings {
    /// Settings used with `--debug`: fast sampling and uploads against a local collector.
    pub fn development() -> Self {
        Self {
            powermetrics: 1000,
            upload_delta: 5,
            api_url: "http://api.green-coding.internal:9142/v1/hog/add".to_string(),
            web_url: "http://metrics.green-coding.internal:9142/hog-details.html?machine_uuid="
                .to_string(),
            ..Self::default()
        }
    }

    /// Loads settings from a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Looks for the per-user settings file in `$HOME`.
    pub fn discover() -> Option<PathBuf> {
        let home = std::env::var_os("HOME")?;
        let path = Path::new(&home).join(SETTINGS_FILE_NAME);
        path.is_file().then_some(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.powermetrics == 0 {
            return Err(ConfigError::Invalid(
                "powermetrics interval must be greater than zero".into(),
            ));
        }
        if self.powermetrics > MAX_INTERVAL_MS {
            return Err(ConfigError::Invalid(format!(
                "powermetrics interval must be at most {MAX_INTERVAL_MS} ms"
            )));
        }
        if self.upload_delta == 0 {
            return Err(ConfigError::Invalid(
                "upload_delta must be greater than zero".into(),
            ));
        }
        if self.upload_delta > MAX_UPLOAD_DELTA_SECS {
            return Err(ConfigError::Invalid(format!(
                "upload_delta must be at most {MAX_UPLOAD_DELTA_SECS} s"
            )));
        }
        if self.upload_data && self.api_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "api_url is required when upload_data is enabled".into(),
            ));
        }
        Ok(())
    }

    pub fn collection_interval(&self) -> Duration {
        Duration::from_millis(self.powermetrics)
    }

    pub fn upload_interval(&self) -> Duration {
        Duration::from_secs(self.upload_delta)
    }

    /// Upper bound on a single wait for powermetrics output.
    pub fn read_timeout(&self) -> Duration {
        self.collection_interval().saturating_mul(2)
    }

    /// Period of both liveness checks: `max(initial_grace, 20 × interval)`.
    pub fn liveness_period(&self) -> Duration {
        Duration::from_secs(self.initial_grace_secs)
            .max(self.collection_interval().saturating_mul(20))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }

    pub fn uploaded_settings(&self) -> UploadedSettings {
        UploadedSettings {
            powermetrics: self.powermetrics,
            upload_delta: self.upload_delta,
            upload_data: self.upload_data,
            client_version: crate::VERSION.to_string(),
        }
    }

    pub fn dashboard_url(&self, machine_uuid: &str) -> String {
        format!("{}{}", self.web_url.trim(), machine_uuid)
    }
}
